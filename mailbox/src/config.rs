//! # Configuration
//!
//! Module dedicated to the bridge configuration. The main structure
//! of this module is [`AccountConfig`].

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

/// The account configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct AccountConfig {
    /// The name of the remote account.
    ///
    /// The account name is used as an unique identifier, in
    /// particular to name the cache directory.
    pub name: String,

    /// The cache directory.
    ///
    /// Defaults to `$XDG_CACHE_HOME/pimalaya-bridge/<md5(name)>`.
    pub cache_dir: Option<PathBuf>,

    /// The mailboxes exposed over IMAP.
    #[cfg_attr(feature = "derive", serde(default))]
    pub mailboxes: MailboxFilter,

    /// The synchronization configuration.
    #[cfg_attr(feature = "derive", serde(default))]
    pub sync: SyncConfig,
}

impl AccountConfig {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn find_default_cache_dir(&self) -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| {
            dir.join("pimalaya-bridge")
                .join(format!("{:x}", md5::compute(&self.name)))
        })
    }

    pub fn find_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .cloned()
            .or_else(|| self.find_default_cache_dir())
    }
}

/// The mailbox filter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum MailboxFilter {
    /// Exposes all mailboxes.
    #[default]
    All,

    /// Exposes only mailboxes matching the given names.
    Include(BTreeSet<String>),

    /// Exposes all mailboxes except the ones matching the given
    /// names.
    Exclude(BTreeSet<String>),
}

impl MailboxFilter {
    pub fn matches(&self, mailbox: &str) -> bool {
        match self {
            Self::All => true,
            Self::Include(mailboxes) => mailboxes.contains(mailbox),
            Self::Exclude(mailboxes) => !mailboxes.contains(mailbox),
        }
    }
}

/// The synchronization configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct SyncConfig {
    /// Whether the remote feed yields creations in remote order.
    ///
    /// When `false`, creations of a batch are sorted by their remote
    /// order before UIDs are allocated.
    #[cfg_attr(feature = "derive", serde(default = "SyncConfig::default_ordered_feed"))]
    pub ordered_feed: bool,

    /// The delay between two feed polls, in seconds.
    #[cfg_attr(
        feature = "derive",
        serde(default = "SyncConfig::default_poll_interval_secs")
    )]
    pub poll_interval_secs: u64,

    #[cfg_attr(feature = "derive", serde(default))]
    pub retry: RetryConfig,

    #[cfg_attr(feature = "derive", serde(default))]
    pub permissions: FlagSyncPermissions,
}

impl SyncConfig {
    fn default_ordered_feed() -> bool {
        true
    }

    fn default_poll_interval_secs() -> u64 {
        30
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ordered_feed: Self::default_ordered_feed(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            retry: Default::default(),
            permissions: Default::default(),
        }
    }
}

/// The retry configuration of the sync runner.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", deny_unknown_fields, default)
)]
pub struct RetryConfig {
    /// The number of retries before giving up on a sync round.
    pub attempts: u8,

    /// The timeout of one remote call, in seconds.
    pub timeout_secs: u64,

    /// The initial delay between two attempts, in seconds. Doubled
    /// after each failed attempt.
    pub backoff_secs: u64,

    /// The maximum delay between two attempts, in seconds.
    pub max_backoff_secs: u64,
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_secs: 30,
            backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}

/// The flag synchronization permissions.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", deny_unknown_fields, default)
)]
pub struct FlagSyncPermissions {
    /// Whether remote flag updates are merged into local flags.
    pub update: bool,
}

impl Default for FlagSyncPermissions {
    fn default() -> Self {
        Self { update: true }
    }
}
