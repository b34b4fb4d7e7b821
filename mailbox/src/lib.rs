//! Rust library to keep IMAP mailbox state in sync with a remote,
//! end-to-end encrypted mail account.
//!
//! The main purpose of this library is to help you to expose a remote
//! account through a local IMAP server without caring about UID
//! allocation, sequence numbers or the way IMAP clients count their
//! messages.
//!
//! This goal is achieved by exposing an
//! [`Account`](crate::account::Account) which owns one
//! [`MailboxHandle`](crate::mailbox::MailboxHandle) per remote
//! folder. Each mailbox is kept up to date by a
//! [`SyncEngine`](crate::sync::SyncEngine) fed by a
//! [`RemoteFeed`](crate::remote::RemoteFeed), and is read or mutated
//! by IMAP connections through a
//! [`Session`](crate::session::Session).
//!
//! See examples in the /tests folder.
//!
//! ## Components
//!
//! - [`UidAllocator`](crate::mailbox::allocator::UidAllocator):
//!   issues UIDs and manages the UIDVALIDITY epoch.
//! - [`RecordStore`](crate::mailbox::record::RecordStore): the
//!   per-mailbox table of message records.
//! - [`MailboxState`](crate::mailbox::state::MailboxState): the
//!   cached EXISTS/RECENT/UNSEEN/UIDNEXT/UIDVALIDITY aggregate.
//! - [`SyncEngine`](crate::sync::SyncEngine): reconciles the local
//!   state against the remote account.
//! - [`Session`](crate::session::Session): the per-connection state
//!   machine and its frozen sequence number view.

pub mod account;
pub mod cache;
pub mod config;
pub mod envelope;
mod error;
pub mod flag;
pub mod mailbox;
pub mod remote;
pub mod retry;
pub mod sequence;
pub mod session;
pub mod sync;
pub mod uid;

#[doc(inline)]
pub use self::error::{AnyBoxedError, AnyError, AnyResult};
