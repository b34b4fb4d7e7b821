mod common;

use std::sync::Arc;

use mailbox::{
    account::{self, Account},
    cache,
    config::AccountConfig,
    flag::{Flag, FlagMode, Flags},
    remote::RemoteListing,
    uid::Uid,
};

use common::{batch, created, message, removed, MockFeed};

fn uid(n: u32) -> Uid {
    Uid::of(n).unwrap()
}

fn config(dir: &tempfile::TempDir) -> AccountConfig {
    let mut config = AccountConfig::new("test");
    config.cache_dir = Some(dir.path().to_owned());
    config
}

#[test_log::test(tokio::test)]
async fn mailbox_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AccountConfig::new("test");
    config.cache_dir = Some(dir.path().to_owned());

    let state = {
        let account = Arc::new(Account::open(config.clone()).unwrap());

        // the cache directory is owned by one bridge at a time
        assert!(matches!(
            Account::open(config.clone()),
            Err(account::Error::CacheError(cache::Error::LockFileError(..)))
        ));

        let feed = Arc::new(MockFeed::default());
        let engine = account.sync_engine("INBOX", feed.clone()).unwrap();

        feed.push(batch(
            vec![created("a", 1, ""), created("b", 2, ""), created("c", 3, "")],
            "1",
        ));
        engine.sync().await.unwrap();

        engine
            .mailbox()
            .set_flags(uid(2), &Flags::from("\\Flagged"), FlagMode::Add)
            .await
            .unwrap();

        let mut session = account.new_session();
        session.authenticate().unwrap();
        session.select("INBOX").await.unwrap();

        // removal queued while the mailbox is selected
        feed.push(batch(vec![removed("c")], "2"));
        engine.sync().await.unwrap();

        engine.mailbox().state().await
    };

    let account = Account::open(config).unwrap();
    assert_eq!(account.mailboxes().unwrap(), vec!["INBOX".to_owned()]);

    let handle = account.mailbox("INBOX").unwrap();
    {
        let mailbox = handle.read().await;
        let restored = mailbox.state();
        assert_eq!(restored.uid_validity, state.uid_validity);
        assert_eq!(restored.uid_next, state.uid_next);
        assert_eq!(restored.exists, 3);
        assert_eq!(restored.recent, 0);
        assert_eq!(mailbox.cursor(), Some("2"));
        assert!(mailbox.pending_expunges().contains(&uid(3)));
        assert!(mailbox.get(uid(2)).unwrap().flags.contains(&Flag::Flagged));
    }

    let feed = Arc::new(MockFeed::default());
    let engine = account.sync_engine("INBOX", feed.clone()).unwrap();
    feed.push(batch(vec![created("d", 4, "")], "3"));

    let report = engine.sync().await.unwrap();
    assert_eq!(report.expunged, vec![uid(3)]);

    let mailbox = handle.read().await;
    assert_eq!(mailbox.records().uid_of("d"), Some(uid(4)));
    assert_eq!(mailbox.state().exists, 3);
}

#[test_log::test(tokio::test)]
async fn deleted_flag_is_not_an_expunge_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let account = Arc::new(Account::open(config(&dir)).unwrap());
        let feed = Arc::new(MockFeed::default());
        let engine = account.sync_engine("INBOX", feed.clone()).unwrap();

        feed.push(batch(
            vec![created("a", 1, ""), created("b", 2, ""), created("c", 3, "")],
            "1",
        ));
        engine.sync().await.unwrap();

        // STORE without EXPUNGE, then the client goes away
        let mut session = account.new_session();
        session.authenticate().unwrap();
        session.select("INBOX").await.unwrap();
        let set = session.message_set("1", false).unwrap();
        session
            .store(&set, &Flags::from("\\Deleted"), FlagMode::Add)
            .await
            .unwrap();
    }

    let account = Account::open(config(&dir)).unwrap();
    let feed = Arc::new(MockFeed::default());
    let engine = account.sync_engine("INBOX", feed.clone()).unwrap();

    let report = engine.sync().await.unwrap();
    assert!(report.expunged.is_empty());

    let mailbox = engine.mailbox().read().await;
    assert_eq!(mailbox.state().exists, 3);
    assert!(mailbox.pending_expunges().is_empty());
    assert!(mailbox.get(uid(1)).unwrap().flags.is_deleted());
}

#[test_log::test(tokio::test)]
async fn regressed_uid_next_is_repaired_on_restart() {
    let dir = tempfile::tempdir().unwrap();

    let uid_validity = {
        let account = Account::open(config(&dir)).unwrap();
        let feed = Arc::new(MockFeed::default());
        let engine = account.sync_engine("INBOX", feed.clone()).unwrap();

        feed.push(batch(vec![created("a", 1, ""), created("b", 2, "")], "1"));
        engine.sync().await.unwrap();

        engine.mailbox().state().await.uid_validity
    };

    // simulates a cache written by an interrupted bridge
    let db = rusqlite::Connection::open(dir.path().join("mailboxes.sqlite")).unwrap();
    db.execute("UPDATE mailboxes SET uid_next = 2 WHERE name = 'INBOX'", [])
        .unwrap();
    drop(db);

    let account = Account::open(config(&dir)).unwrap();
    let feed = Arc::new(MockFeed::default());
    let engine = account.sync_engine("INBOX", feed.clone()).unwrap();
    assert!(engine.mailbox().read().await.check_integrity().is_err());

    feed.set_listing(RemoteListing {
        messages: vec![message("a", 1, ""), message("b", 2, ""), message("c", 3, "")],
        cursor: Some("5".into()),
        ..Default::default()
    });

    let report = engine.sync().await.unwrap();
    assert!(report.resynced);
    assert!(!report.invalidated);
    assert_eq!(report.created, 1);

    let mailbox = engine.mailbox().read().await;
    assert!(mailbox.check_integrity().is_ok());
    assert_eq!(mailbox.records().uid_of("c"), Some(uid(3)));
    assert_eq!(mailbox.cursor(), Some("5"));

    let state = mailbox.state();
    assert_eq!(state.uid_validity, uid_validity);
    assert_eq!(state.uid_next, uid(4));
}
