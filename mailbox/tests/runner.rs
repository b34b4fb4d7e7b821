mod common;

use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use mailbox::{account::Account, config::AccountConfig};

use common::{batch, created, MockFeed};

#[test_log::test(tokio::test)]
async fn runner_retries_failed_rounds() {
    let mut config = AccountConfig::new("test");
    config.sync.poll_interval_secs = 3600;
    config.sync.retry.backoff_secs = 0;
    config.sync.retry.attempts = 3;

    let account = Account::new(config);
    let feed = Arc::new(MockFeed::default());
    feed.fail(2);
    feed.push(batch(vec![created("a", 1, "")], "1"));

    let runner = account.spawn_sync("INBOX", feed.clone()).unwrap();
    assert_eq!(runner.name(), "INBOX");

    let mailbox = account.mailbox("INBOX").unwrap();
    for _ in 0..500 {
        if mailbox.state().await.exists == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(mailbox.state().await.exists, 1);
    assert_eq!(feed.fetches.load(Ordering::SeqCst), 3);

    // the runner now waits for the next poll
    assert!(!runner.is_finished());
    runner.shutdown().await.unwrap();
}
