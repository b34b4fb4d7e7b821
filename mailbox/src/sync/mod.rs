//! # Synchronization
//!
//! Module dedicated to the synchronization of a mailbox with the
//! remote account. The main structure of this module is
//! [`SyncEngine`], the sole writer of mailbox identity: it is the only
//! path allocating UIDs.
//!
//! Remote events are applied batch by batch, inside one mailbox
//! mutation committed only once persisted together with the feed
//! cursor. A batch that cannot fully commit is rolled back, and the
//! next attempt resumes from the last committed cursor.

pub mod patch;
pub mod report;
pub mod runner;

use std::{collections::HashMap, fmt, future::Future, pin::Pin, result, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::SyncConfig,
    envelope::Envelope,
    mailbox::{self, Mailbox, MailboxHandle, MessageData},
    remote::{Decrypt, EventBatch, RemoteEvent, RemoteFeed, RemoteMessage, RemotePayload},
    uid::{Uid, UidValidity},
    AnyBoxedError, AnyResult,
};

#[doc(inline)]
pub use self::{patch::ResyncHunk, report::SyncReport, runner::SyncRunner};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot reach remote account for mailbox {1}")]
    TransientRemoteFailure(#[source] AnyBoxedError, String),
    #[error("cannot reach remote account for mailbox {0}: request timed out")]
    RemoteTimeoutError(String),
    #[error("cannot stop sync runner of mailbox {1}")]
    JoinRunnerError(#[source] tokio::task::JoinError, String),
    #[error(transparent)]
    MailboxError(#[from] mailbox::Error),
}

impl Error {
    /// Returns `true` if retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientRemoteFailure(..) | Self::RemoteTimeoutError(_)
        )
    }
}

/// The synchronization async event handler.
pub type SyncEventHandler =
    dyn Fn(SyncEvent) -> Pin<Box<dyn Future<Output = AnyResult<()>> + Send>> + Send + Sync;

/// The synchronization event.
///
/// Represents all the events that can be triggered during the
/// synchronization of a mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncEvent {
    FetchedRemoteEvents(String, usize),
    ListedRemoteMessages(String, usize),
    ProcessedResyncHunk(String, ResyncHunk),
    AppliedBatch(String, SyncReport),
    Resynced(String, SyncReport),
    Invalidated(String, UidValidity),
}

impl SyncEvent {
    pub async fn emit(&self, handler: &Option<Arc<SyncEventHandler>>) {
        if let Some(handler) = handler.as_ref() {
            if let Err(err) = handler(self.clone()).await {
                debug!("error while emitting sync event: {err}");
                trace!("{err:?}");
            } else {
                debug!("emitted sync event {self:?}");
            }
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::FetchedRemoteEvents(mailbox, n) => {
                write!(f, "Fetched {n} remote events for {mailbox}")
            }
            SyncEvent::ListedRemoteMessages(mailbox, n) => {
                write!(f, "Listed {n} remote messages from {mailbox}")
            }
            SyncEvent::ProcessedResyncHunk(mailbox, hunk) => {
                write!(f, "{hunk} in {mailbox}")
            }
            SyncEvent::AppliedBatch(mailbox, report) => {
                write!(f, "Applied batch to {mailbox}: {report}")
            }
            SyncEvent::Resynced(mailbox, report) => {
                write!(f, "Resynced {mailbox}: {report}")
            }
            SyncEvent::Invalidated(mailbox, uid_validity) => {
                write!(f, "Invalidated {mailbox}, new uid validity {uid_validity}")
            }
        }
    }
}

/// A remote event ready to be applied: encrypted payloads are already
/// decrypted.
#[derive(Clone, Debug)]
enum PreparedEvent {
    Create(MessageData),
    Update(RemoteEvent),
    Remove(String),
}

/// The synchronization engine of one mailbox.
#[derive(Clone)]
pub struct SyncEngine {
    mailbox: MailboxHandle,
    feed: Arc<dyn RemoteFeed>,
    decrypt: Option<Arc<dyn Decrypt>>,
    config: SyncConfig,
    handler: Option<Arc<SyncEventHandler>>,
}

impl SyncEngine {
    pub fn new(mailbox: MailboxHandle, feed: Arc<dyn RemoteFeed>, config: SyncConfig) -> Self {
        Self {
            mailbox,
            feed,
            decrypt: None,
            config,
            handler: None,
        }
    }

    pub fn set_some_decrypt(&mut self, decrypt: Option<Arc<dyn Decrypt>>) {
        self.decrypt = decrypt;
    }

    pub fn with_decrypt(mut self, decrypt: Arc<dyn Decrypt>) -> Self {
        self.set_some_decrypt(Some(decrypt));
        self
    }

    pub fn set_some_handler<F: Future<Output = AnyResult<()>> + Send + 'static>(
        &mut self,
        handler: Option<impl Fn(SyncEvent) -> F + Send + Sync + 'static>,
    ) {
        self.handler = match handler {
            Some(handler) => Some(Arc::new(move |evt| Box::pin(handler(evt)))),
            None => None,
        };
    }

    pub fn with_handler<F: Future<Output = AnyResult<()>> + Send + 'static>(
        mut self,
        handler: impl Fn(SyncEvent) -> F + Send + Sync + 'static,
    ) -> Self {
        self.set_some_handler(Some(handler));
        self
    }

    pub fn mailbox(&self) -> &MailboxHandle {
        &self.mailbox
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetches the remote events since the last committed cursor and
    /// applies them.
    pub async fn sync(&self) -> Result<SyncReport> {
        let name = self.mailbox.name();
        let cursor = self.mailbox.read().await.cursor().map(ToOwned::to_owned);
        debug!(mailbox = name, ?cursor, "fetching remote events");

        let batch = self
            .feed
            .fetch_events(name, cursor.as_deref())
            .await
            .map_err(|err| Error::TransientRemoteFailure(err, name.to_owned()))?;

        SyncEvent::FetchedRemoteEvents(name.to_owned(), batch.events.len())
            .emit(&self.handler)
            .await;

        self.apply(Some(cursor), batch).await
    }

    /// Applies the given batch, whatever the cursor it was fetched
    /// from.
    pub async fn apply_batch(&self, batch: EventBatch) -> Result<SyncReport> {
        self.apply(None, batch).await
    }

    /// Applies the given batch, fetched from the given cursor.
    ///
    /// Fails with a conflict if the committed cursor moved since.
    pub async fn apply_batch_from(
        &self,
        cursor: Option<&str>,
        batch: EventBatch,
    ) -> Result<SyncReport> {
        self.apply(Some(cursor.map(ToOwned::to_owned)), batch).await
    }

    async fn apply(&self, from: Option<Option<String>>, batch: EventBatch) -> Result<SyncReport> {
        let name = self.mailbox.name();

        if batch.gap {
            info!(mailbox = name, "remote feed reported a gap, resyncing");
            return self.resync_from(batch.cursor).await;
        }

        let integrity = self.mailbox.read().await.check_integrity();
        if let Err(err) = integrity {
            warn!(mailbox = name, "{err}, resyncing");
            return self.resync_from(batch.cursor).await;
        }

        let cursor = batch.cursor.clone();

        match self.apply_events(from, batch).await {
            Err(Error::MailboxError(mailbox::Error::UidSpaceExhaustedError)) => {
                warn!(mailbox = name, "uid space exhausted, invalidating");
                self.invalidate().await?;
                self.resync_from(cursor).await
            }
            Err(Error::MailboxError(mailbox::Error::DesyncError(_, desync))) => {
                warn!(mailbox = name, "{desync}, resyncing");
                self.resync_from(cursor).await
            }
            res => res,
        }
    }

    #[instrument(skip_all, fields(mailbox = %self.mailbox.name(), events = batch.events.len()))]
    async fn apply_events(
        &self,
        from: Option<Option<String>>,
        batch: EventBatch,
    ) -> Result<SyncReport> {
        let mut events = Vec::with_capacity(batch.events.len());

        for event in batch.events {
            let event = match event {
                RemoteEvent::Created(message) => PreparedEvent::Create(self.prepare(message).await),
                RemoteEvent::Removed(id) => PreparedEvent::Remove(id),
                event => PreparedEvent::Update(event),
            };
            events.push(event);
        }

        if !self.config.ordered_feed {
            sort_creations(&mut events);
        }

        let update_flags = self.config.permissions.update;
        let cursor = batch.cursor;

        let report = self
            .mailbox
            .mutate(|mailbox| {
                if let Some(from) = &from {
                    if mailbox.cursor() != from.as_deref() {
                        let name = mailbox.name();
                        warn!(mailbox = name, ?from, "cursor moved while fetching events");
                        return Err(mailbox::Error::ConflictError(
                            mailbox.name().to_owned(),
                            String::from("cursor moved while fetching events"),
                        ));
                    }
                }

                let mut report = SyncReport::default();

                for event in events {
                    match event {
                        PreparedEvent::Create(data) => {
                            if mailbox.upsert(data)?.created {
                                report.created += 1;
                            } else {
                                report.updated += 1;
                            }
                        }
                        PreparedEvent::Update(RemoteEvent::Updated { id, flags, at }) => {
                            if !update_flags {
                                report.skipped += 1;
                                continue;
                            }

                            match mailbox.merge_remote_flags(&id, &flags, at) {
                                Some((_, true)) => report.updated += 1,
                                Some((_, false)) => (),
                                None => {
                                    debug!(remote_id = %id, "skipping update of unknown message");
                                    report.skipped += 1;
                                }
                            }
                        }
                        PreparedEvent::Update(_) => report.skipped += 1,
                        PreparedEvent::Remove(id) => match mailbox.mark_removed(&id) {
                            Some(_) => report.removed += 1,
                            None => {
                                debug!(remote_id = %id, "skipping removal of unknown message");
                                report.skipped += 1;
                            }
                        },
                    }
                }

                if cursor.is_some() {
                    mailbox.set_cursor(cursor);
                }

                report.expunged = self.flush_if_unselected(mailbox);
                Ok(report)
            })
            .await?;

        debug!("{report}");
        SyncEvent::AppliedBatch(self.mailbox.name().to_owned(), report.clone())
            .emit(&self.handler)
            .await;

        Ok(report)
    }

    /// Re-lists the whole remote mailbox and makes the local records
    /// match it.
    ///
    /// The UID validity only changes if the remote mailbox was
    /// recreated, or if the local mapping is broken beyond repair.
    pub async fn resync(&self) -> Result<SyncReport> {
        self.resync_from(None).await
    }

    #[instrument(skip_all, fields(mailbox = %self.mailbox.name()))]
    async fn resync_from(&self, fallback_cursor: Option<String>) -> Result<SyncReport> {
        let name = self.mailbox.name();
        info!("starting full resync");

        let listing = self
            .feed
            .full_list(name)
            .await
            .map_err(|err| Error::TransientRemoteFailure(err, name.to_owned()))?;

        SyncEvent::ListedRemoteMessages(name.to_owned(), listing.messages.len())
            .emit(&self.handler)
            .await;

        // decide what to invalidate before decrypting, so that only
        // messages needing a record are decrypted
        let (invalidate, known) = {
            let mailbox = self.mailbox.read().await;
            let broken = match mailbox.check_integrity() {
                Err(mailbox::Error::DesyncError(_, desync)) => !desync.is_repairable(),
                _ => false,
            };
            let invalidate = listing.recreated || broken;

            let known: Vec<bool> = listing
                .messages
                .iter()
                .map(|message| !invalidate && mailbox.records().uid_of(&message.id).is_some())
                .collect();

            (invalidate, known)
        };

        let mut prepared: HashMap<String, MessageData> = HashMap::new();
        for (message, known) in listing.messages.iter().zip(known) {
            if !known && !prepared.contains_key(&message.id) {
                prepared.insert(message.id.clone(), self.prepare(message.clone()).await);
            }
        }

        let update_flags = self.config.permissions.update;
        let remote_at = listing.at;
        let cursor = listing.cursor.or(fallback_cursor);
        let messages = listing.messages;

        let (report, hunks) = self
            .mailbox
            .mutate(|mailbox| {
                let mut report = SyncReport {
                    resynced: true,
                    ..Default::default()
                };

                if invalidate {
                    mailbox.invalidate();
                    report.invalidated = true;
                } else if let Err(mailbox::Error::DesyncError(_, desync)) =
                    mailbox.check_integrity()
                {
                    if desync.is_repairable() {
                        mailbox.repair_uid_next();
                    } else {
                        mailbox.invalidate();
                        report.invalidated = true;
                    }
                }

                let hunks = patch::build(mailbox.records(), &messages);

                for hunk in &hunks {
                    match hunk {
                        ResyncHunk::Remove(id) => {
                            if mailbox.mark_removed(id).is_some() {
                                report.removed += 1;
                            }
                        }
                        ResyncHunk::UpdateFlags(id, flags) => {
                            if !update_flags {
                                report.skipped += 1;
                                continue;
                            }
                            let merged = mailbox.merge_remote_flags(id, flags, remote_at);
                            if let Some((_, true)) = merged {
                                report.updated += 1;
                            }
                        }
                        ResyncHunk::Create(id) => {
                            let Some(data) = prepared.get(id) else {
                                return Err(mailbox::Error::ConflictError(
                                    mailbox.name().to_owned(),
                                    format!("record of remote message {id} vanished during resync"),
                                ));
                            };
                            mailbox.upsert(data.clone())?;
                            report.created += 1;
                        }
                    }
                }

                mailbox.set_cursor(cursor);
                report.expunged = self.flush_if_unselected(mailbox);

                Ok((report, hunks))
            })
            .await?;

        for hunk in hunks {
            SyncEvent::ProcessedResyncHunk(name.to_owned(), hunk)
                .emit(&self.handler)
                .await;
        }

        if report.invalidated {
            let uid_validity = self.mailbox.state().await.uid_validity;
            info!(%uid_validity, "mailbox invalidated");
            SyncEvent::Invalidated(name.to_owned(), uid_validity)
                .emit(&self.handler)
                .await;
        }

        info!("{report}");
        SyncEvent::Resynced(name.to_owned(), report.clone())
            .emit(&self.handler)
            .await;

        Ok(report)
    }

    /// Discards every UID assignment of the mailbox.
    pub async fn invalidate(&self) -> Result<UidValidity> {
        let uid_validity = self.mailbox.invalidate().await?;

        SyncEvent::Invalidated(self.mailbox.name().to_owned(), uid_validity)
            .emit(&self.handler)
            .await;

        Ok(uid_validity)
    }

    /// Flushes pending expunges when no session can be notified.
    /// Otherwise they are flushed at the next session poll.
    fn flush_if_unselected(&self, mailbox: &mut Mailbox) -> Vec<Uid> {
        if self.mailbox.selected_sessions() == 0 {
            mailbox.flush_pending_expunges()
        } else {
            Vec::new()
        }
    }

    /// Turns a remote message into record data, decrypting its payload
    /// if needed. A decryption failure does not fail the batch: the
    /// message is kept with an empty envelope and a decode error.
    async fn prepare(&self, message: RemoteMessage) -> MessageData {
        let (envelope, decode_error) = match message.payload {
            RemotePayload::Plain(envelope) => (envelope, None),
            RemotePayload::Encrypted(payload) => match &self.decrypt {
                Some(decrypt) => match decrypt.decrypt(&message.id, &payload).await {
                    Ok(envelope) => (envelope, None),
                    Err(err) => {
                        warn!(remote_id = %message.id, "cannot decrypt message: {err}");
                        trace!("{err:?}");
                        (Envelope::default(), Some(err.to_string()))
                    }
                },
                None => {
                    let remote_id = &message.id;
                    warn!(%remote_id, "cannot decrypt message: no decryption available");
                    (
                        Envelope::default(),
                        Some(String::from("no decryption available")),
                    )
                }
            },
        };

        MessageData {
            remote_id: message.id,
            flags: message.flags,
            size: message.size,
            envelope,
            remote_order: message.order,
            decode_error,
        }
    }
}

/// Sorts creations by remote order, leaving other events in place.
fn sort_creations(events: &mut [PreparedEvent]) {
    let slots: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| matches!(event, PreparedEvent::Create(_)))
        .map(|(ix, _)| ix)
        .collect();

    let mut creations: Vec<MessageData> = slots
        .iter()
        .filter_map(|ix| match &events[*ix] {
            PreparedEvent::Create(data) => Some(data.clone()),
            _ => None,
        })
        .collect();
    creations.sort_by_key(|data| data.remote_order);

    for (ix, data) in slots.into_iter().zip(creations) {
        events[ix] = PreparedEvent::Create(data);
    }
}
