//! # Remote collaborators
//!
//! Module dedicated to the contracts of the collaborators the engine
//! consumes: the [`RemoteFeed`] yielding remote message events, and
//! the [`Decrypt`] collaborator turning opaque payloads into
//! envelopes. Implementations live outside of this library. They own
//! the transport and the credentials needed to talk to the remote
//! account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{envelope::Envelope, flag::Flags, mailbox::RemoteId, AnyResult};

/// The payload of a remote message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemotePayload {
    /// The envelope is already available in clear.
    Plain(Envelope),

    /// The envelope needs to be decrypted by the [`Decrypt`]
    /// collaborator.
    Encrypted(Vec<u8>),
}

/// A message as listed by the remote account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteMessage {
    /// The opaque identifier of the message.
    pub id: RemoteId,

    /// The remote monotonic order of the message, used to sort
    /// creations when the feed does not guarantee order.
    pub order: u64,

    pub flags: Flags,
    pub size: u32,
    pub payload: RemotePayload,
}

/// The remote message event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RemoteEvent {
    /// A message appeared in the mailbox.
    Created(RemoteMessage),

    /// The flags of a message changed remotely. `at` is the time the
    /// flags were taken on the remote account.
    Updated {
        id: RemoteId,
        flags: Flags,
        at: DateTime<Utc>,
    },

    /// A message disappeared from the mailbox.
    Removed(RemoteId),
}

impl RemoteEvent {
    pub fn remote_id(&self) -> &str {
        match self {
            Self::Created(message) => &message.id,
            Self::Updated { id, .. } => id,
            Self::Removed(id) => id,
        }
    }
}

/// A batch of remote events.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventBatch {
    pub events: Vec<RemoteEvent>,

    /// The cursor to resume from once the batch is applied.
    pub cursor: Option<String>,

    /// The feed could not explain the delta since the given cursor.
    pub gap: bool,
}

/// The full listing of a remote mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteListing {
    pub messages: Vec<RemoteMessage>,

    /// The remote mailbox was recreated: every UID assignment is
    /// void.
    pub recreated: bool,

    /// The cursor to resume events from.
    pub cursor: Option<String>,

    /// The time the listing was taken on the remote account.
    pub at: DateTime<Utc>,
}

impl Default for RemoteListing {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            recreated: false,
            cursor: None,
            at: Utc::now(),
        }
    }
}

/// The remote feed.
///
/// Yields events per mailbox, ordered or orderable by
/// [`RemoteMessage::order`].
#[async_trait]
pub trait RemoteFeed: Send + Sync {
    /// Fetches the events that happened in the given mailbox since the
    /// given cursor. A `None` cursor means from the beginning.
    async fn fetch_events(&self, mailbox: &str, cursor: Option<&str>) -> AnyResult<EventBatch>;

    /// Lists every message of the given mailbox.
    async fn full_list(&self, mailbox: &str) -> AnyResult<RemoteListing>;
}

/// The decryption collaborator.
#[async_trait]
pub trait Decrypt: Send + Sync {
    /// Decrypts the given payload into an envelope.
    async fn decrypt(&self, remote_id: &str, payload: &[u8]) -> AnyResult<Envelope>;
}
