//! # Account
//!
//! Module dedicated to the bridged account. The [`Account`] owns the
//! registry of mailboxes exposed over IMAP, opens them lazily from
//! the cache and hands out sessions and synchronization workers.

use std::{
    collections::HashMap,
    result,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    cache::{self, MailboxCache},
    config::AccountConfig,
    mailbox::{Mailbox, MailboxHandle},
    remote::RemoteFeed,
    session::Session,
    sync::{runner::SyncRunner, SyncEngine},
};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find cache directory of account {0}")]
    GetCacheDirError(String),
    #[error("cannot open mailbox {0}: mailbox not exposed")]
    MailboxFilteredError(String),
    #[error("cannot lock mailbox registry")]
    LockRegistryError,
    #[error(transparent)]
    CacheError(#[from] cache::Error),
}

/// The bridged account.
///
/// Mailboxes are opened once and shared by every session and worker
/// of the account.
#[derive(Debug)]
pub struct Account {
    config: AccountConfig,
    cache: Option<Arc<MailboxCache>>,
    mailboxes: Mutex<HashMap<String, MailboxHandle>>,
}

impl Account {
    /// Creates an account living in memory only.
    pub fn new(config: AccountConfig) -> Self {
        Self {
            config,
            cache: None,
            mailboxes: Default::default(),
        }
    }

    /// Creates an account persisted in the given cache.
    pub fn with_cache(config: AccountConfig, cache: MailboxCache) -> Self {
        Self {
            config,
            cache: Some(Arc::new(cache)),
            mailboxes: Default::default(),
        }
    }

    /// Opens the account with its cache directory, locking it.
    ///
    /// Fails if another bridge instance already uses the same cache.
    pub fn open(config: AccountConfig) -> Result<Self> {
        let dir = config
            .find_cache_dir()
            .ok_or_else(|| Error::GetCacheDirError(config.name.clone()))?;
        info!(account = %config.name, "opening account cache at {dir:?}");

        let cache = MailboxCache::open_locked(&dir)?;
        Ok(Self::with_cache(config, cache))
    }

    pub fn config(&self) -> &AccountConfig {
        &self.config
    }

    /// Returns the handle of the given mailbox, opening it if needed.
    ///
    /// A mailbox known by the cache is restored from it, otherwise it
    /// starts empty.
    pub fn mailbox(&self, name: &str) -> Result<MailboxHandle> {
        if !self.config.mailboxes.matches(name) {
            return Err(Error::MailboxFilteredError(name.to_owned()));
        }

        let mut mailboxes = self
            .mailboxes
            .lock()
            .map_err(|_| Error::LockRegistryError)?;

        if let Some(handle) = mailboxes.get(name) {
            return Ok(handle.clone());
        }

        let cached = match &self.cache {
            Some(cache) => cache.load(name)?,
            None => None,
        };

        let mailbox = match cached {
            Some(mailbox) => {
                debug!(mailbox = name, "restored mailbox from cache");
                if let Err(err) = mailbox.check_integrity() {
                    warn!(mailbox = name, "{err}, waiting for next resync");
                }
                mailbox
            }
            None => {
                debug!(mailbox = name, "opened new mailbox");
                Mailbox::new(name)
            }
        };

        let handle = MailboxHandle::new(mailbox, self.cache.clone());
        mailboxes.insert(name.to_owned(), handle.clone());

        Ok(handle)
    }

    /// Returns the names of the exposed mailboxes known by the
    /// account, opened or cached.
    pub fn mailboxes(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = match &self.cache {
            Some(cache) => cache.list()?,
            None => Vec::new(),
        };

        {
            let mailboxes = self
                .mailboxes
                .lock()
                .map_err(|_| Error::LockRegistryError)?;
            names.extend(mailboxes.keys().cloned());
        }

        names.retain(|name| self.config.mailboxes.matches(name));
        names.sort();
        names.dedup();

        Ok(names)
    }

    /// Creates a new, unauthenticated IMAP session.
    pub fn new_session(self: &Arc<Self>) -> Session {
        Session::new(self.clone())
    }

    /// Builds the synchronization engine of the given mailbox.
    pub fn sync_engine(&self, name: &str, feed: Arc<dyn RemoteFeed>) -> Result<SyncEngine> {
        let mailbox = self.mailbox(name)?;
        Ok(SyncEngine::new(mailbox, feed, self.config.sync.clone()))
    }

    /// Spawns the synchronization worker of the given mailbox.
    pub fn spawn_sync(&self, name: &str, feed: Arc<dyn RemoteFeed>) -> Result<SyncRunner> {
        let engine = self.sync_engine(name, feed)?;
        Ok(SyncRunner::spawn(engine))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::{
        cache::MailboxCache,
        config::{AccountConfig, MailboxFilter},
        mailbox::MessageData,
    };

    use super::{Account, Error};

    fn config() -> AccountConfig {
        let mut config = AccountConfig::new("test");
        config.mailboxes = MailboxFilter::Exclude(BTreeSet::from_iter(["Spam".to_owned()]));
        config
    }

    fn message(remote_id: &str) -> MessageData {
        MessageData {
            remote_id: remote_id.into(),
            ..Default::default()
        }
    }

    #[test_log::test(tokio::test)]
    async fn mailboxes_are_shared() {
        let account = Account::new(config());

        let inbox = account.mailbox("INBOX").unwrap();
        inbox
            .mutate(|mailbox| mailbox.upsert(message("a")))
            .await
            .unwrap();

        let same = account.mailbox("INBOX").unwrap();
        assert_eq!(same.state().await.exists, 1);
        assert_eq!(account.mailboxes().unwrap(), vec!["INBOX".to_owned()]);
    }

    #[test_log::test(tokio::test)]
    async fn filtered_mailboxes_are_rejected() {
        let account = Account::new(config());
        let err = account.mailbox("Spam").unwrap_err();
        assert!(matches!(err, Error::MailboxFilteredError(name) if name == "Spam"));
    }

    #[test_log::test(tokio::test)]
    async fn mailboxes_are_restored_from_cache() {
        let dir = tempfile::tempdir().unwrap();

        {
            let cache = MailboxCache::open(dir.path().join("cache.sqlite")).unwrap();
            let account = Account::with_cache(config(), cache);
            let inbox = account.mailbox("INBOX").unwrap();
            inbox
                .mutate(|mailbox| mailbox.upsert(message("a")))
                .await
                .unwrap();
        }

        let cache = MailboxCache::open(dir.path().join("cache.sqlite")).unwrap();
        let account = Account::with_cache(config(), cache);
        assert_eq!(account.mailboxes().unwrap(), vec!["INBOX".to_owned()]);

        let state = account.mailbox("INBOX").unwrap().state().await;
        assert_eq!(state.exists, 1);
        assert_eq!(state.uid_next.get(), 2);
    }
}
