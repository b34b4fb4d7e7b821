//! # Mailbox
//!
//! Module dedicated to mailboxes. A [`Mailbox`] bundles the
//! [`UidAllocator`], the [`RecordStore`] and the cached
//! [`MailboxState`] of one remote folder, together with the queue of
//! pending expunges and the remote feed cursor.
//!
//! A mailbox is shared through a [`MailboxHandle`], which owns the
//! per-mailbox exclusive mutation section: every mutation is applied
//! in place under the write lock while journaling what it changes,
//! persisted, then committed at once. A failed mutation is rolled
//! back from its journal. Readers never observe a half-applied
//! mutation.

pub mod allocator;
pub mod record;
pub mod snapshot;
pub mod state;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, result,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::{
    cache::{self, MailboxCache},
    envelope::Envelope,
    flag::{merge, Flag, FlagMode, Flags, UNDECRYPTABLE},
    uid::{ModSeq, Seqnum, Uid, UidValidity},
};

#[doc(inline)]
pub use self::{
    allocator::UidAllocator,
    record::{MessageRecord, RecordStore, RemoteId},
    snapshot::{Snapshot, SnapshotEntry},
    state::MailboxState,
};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find message with uid {1} in mailbox {0}")]
    UidNotFoundError(String, Uid),
    #[error("cannot find message at sequence number {1} in mailbox {0}")]
    SeqnumNotFoundError(String, Seqnum),
    #[error("cannot apply changes to mailbox {0}: {1}")]
    ConflictError(String, String),
    #[error("mailbox {0} is out of sync: {1}")]
    DesyncError(String, Desync),
    #[error("cannot allocate uid: uid space exhausted")]
    UidSpaceExhaustedError,
    #[error("cannot persist mailbox {1}")]
    PersistMailboxError(#[source] cache::Error, String),
}

impl Error {
    /// Returns `true` for errors referencing a message that does not
    /// exist anymore.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UidNotFoundError(..) | Self::SeqnumNotFoundError(..)
        )
    }
}

/// The kind of invariant violation found by
/// [`Mailbox::check_integrity`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Desync {
    /// The same UID is assigned to two records.
    DuplicateUid(Uid),
    /// `uid_next` is not greater than the given UID, which is already
    /// assigned.
    UidNextRegression(Uid),
    /// The remote identifier index disagrees with the records.
    BrokenRemoteIndex,
}

impl Desync {
    /// Returns `true` if the violation can be repaired without
    /// discarding UID assignments.
    pub fn is_repairable(&self) -> bool {
        matches!(self, Self::UidNextRegression(_))
    }
}

impl fmt::Display for Desync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateUid(uid) => write!(f, "uid {uid} is assigned twice"),
            Self::UidNextRegression(uid) => {
                write!(f, "uid next is not greater than assigned uid {uid}")
            }
            Self::BrokenRemoteIndex => write!(f, "remote id index is broken"),
        }
    }
}

/// The message data used to create or refresh a record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MessageData {
    pub remote_id: RemoteId,
    pub flags: Flags,
    pub size: u32,
    pub envelope: Envelope,
    pub remote_order: u64,
    pub decode_error: Option<String>,
}

/// The outcome of [`Mailbox::upsert`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Upserted {
    pub uid: Uid,
    pub created: bool,
}

/// The changes made to a mailbox since they were last persisted.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Dirty {
    /// The mailbox row itself changed.
    pub mailbox: bool,
    /// All records were dropped.
    pub reset: bool,
    /// Records created or modified.
    pub upserted: BTreeSet<Uid>,
    /// Records removed.
    pub removed: BTreeSet<Uid>,
}

impl Dirty {
    pub fn is_empty(&self) -> bool {
        !self.mailbox && !self.reset && self.upserted.is_empty() && self.removed.is_empty()
    }

    fn touch(&mut self, uid: Uid) {
        self.mailbox = true;
        self.upserted.insert(uid);
    }

    fn remove(&mut self, uid: Uid) {
        self.mailbox = true;
        self.upserted.remove(&uid);
        self.removed.insert(uid);
    }
}

/// What an in-flight mutation is about to change, used to roll it
/// back.
#[derive(Debug)]
struct Journal {
    allocator: UidAllocator,
    modseq: ModSeq,
    cursor: Option<String>,
    pending_expunges: BTreeSet<Uid>,
    state: Option<MailboxState>,
    dirty: Dirty,

    /// Records as they were before their first change, `None` for
    /// records created by the mutation.
    records: BTreeMap<Uid, Option<MessageRecord>>,

    /// The whole store, taken before the mutation dropped every
    /// record. Records changed afterwards are not journaled.
    store: Option<RecordStore>,
}

/// The mailbox.
#[derive(Debug)]
pub struct Mailbox {
    name: String,
    allocator: UidAllocator,
    records: RecordStore,
    modseq: ModSeq,
    cursor: Option<String>,
    pending_expunges: BTreeSet<Uid>,

    /// The cached aggregate, `None` when a mutation has not been
    /// committed yet.
    state: Option<MailboxState>,
    dirty: Dirty,
    journal: Option<Box<Journal>>,
}

impl Mailbox {
    /// Creates a brand new, empty mailbox.
    pub fn new(name: impl ToString) -> Self {
        let mut mailbox = Self {
            name: name.to_string(),
            allocator: UidAllocator::new(),
            records: RecordStore::new(),
            modseq: ModSeq::default(),
            cursor: None,
            pending_expunges: BTreeSet::new(),
            state: None,
            dirty: Dirty {
                mailbox: true,
                ..Default::default()
            },
            journal: None,
        };
        mailbox.commit();
        mailbox
    }

    /// Restores a mailbox from persisted parts.
    ///
    /// Pending expunges not matching any record are dropped.
    pub fn restore(
        name: impl ToString,
        allocator: UidAllocator,
        records: RecordStore,
        modseq: ModSeq,
        cursor: Option<String>,
        mut pending_expunges: BTreeSet<Uid>,
    ) -> Self {
        pending_expunges.retain(|uid| records.get(*uid).is_some());

        let mut mailbox = Self {
            name: name.to_string(),
            allocator,
            records,
            modseq,
            cursor,
            pending_expunges,
            state: None,
            dirty: Dirty::default(),
            journal: None,
        };
        mailbox.commit();
        mailbox
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocator(&self) -> &UidAllocator {
        &self.allocator
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn get(&self, uid: Uid) -> Option<&MessageRecord> {
        self.records.get(uid)
    }

    pub fn modseq(&self) -> ModSeq {
        self.modseq
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn set_cursor(&mut self, cursor: Option<String>) {
        if self.cursor != cursor {
            self.cursor = cursor;
            self.dirty.mailbox = true;
        }
    }

    pub fn pending_expunges(&self) -> &BTreeSet<Uid> {
        &self.pending_expunges
    }

    /// Returns the aggregate at the last commit, or computes it if a
    /// mutation is in flight.
    pub fn state(&self) -> MailboxState {
        match &self.state {
            Some(state) => state.clone(),
            None => MailboxState::compute(&self.allocator, &self.records, self.modseq),
        }
    }

    /// Takes a point-in-time snapshot of the mailbox membership.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(
            self.allocator.current_validity(),
            self.modseq,
            self.records.iter().map(SnapshotEntry::from).collect(),
        )
    }

    /// Starts journaling changes, so that they can be rolled back.
    fn begin(&mut self) {
        self.journal = Some(Box::new(Journal {
            allocator: self.allocator.clone(),
            modseq: self.modseq,
            cursor: self.cursor.clone(),
            pending_expunges: self.pending_expunges.clone(),
            state: self.state.clone(),
            dirty: self.dirty.clone(),
            records: BTreeMap::new(),
            store: None,
        }));
    }

    /// Stops journaling, keeping the changes.
    fn end(&mut self) {
        self.journal = None;
    }

    /// Reverts every change made since [`Mailbox::begin`].
    fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        let journal = *journal;

        if let Some(store) = journal.store {
            self.records = store;
        }

        for (uid, record) in journal.records {
            match record {
                Some(record) => self.records.restore(record),
                None => {
                    self.records.remove(uid);
                }
            }
        }

        self.allocator = journal.allocator;
        self.modseq = journal.modseq;
        self.cursor = journal.cursor;
        self.pending_expunges = journal.pending_expunges;
        self.state = journal.state;
        self.dirty = journal.dirty;

        debug!(mailbox = %self.name, "rolled back mutation");
    }

    /// Journals the record with the given UID before its first change.
    fn journal_record(&mut self, uid: Uid) {
        let Some(journal) = &mut self.journal else {
            return;
        };

        if journal.store.is_none() {
            let records = &self.records;
            journal
                .records
                .entry(uid)
                .or_insert_with(|| records.get(uid).cloned());
        }
    }

    /// Journals records removed from the store.
    fn journal_removed(&mut self, removed: Vec<MessageRecord>) {
        let Some(journal) = &mut self.journal else {
            return;
        };

        if journal.store.is_none() {
            for record in removed {
                journal.records.entry(record.uid).or_insert(Some(record));
            }
        }
    }

    fn bump_modseq(&mut self) -> ModSeq {
        self.modseq = self.modseq.next();
        self.state = None;
        self.modseq
    }

    /// Creates a record for an unknown remote id, or refreshes the
    /// cached envelope and size of a known one.
    ///
    /// Flags of a known record are never touched: use
    /// [`Mailbox::merge_remote_flags`] instead.
    pub fn upsert(&mut self, data: MessageData) -> Result<Upserted> {
        if let Some(uid) = self.records.uid_of(&data.remote_id) {
            let modseq = self.modseq.next();
            let Some(record) = self.records.get(uid) else {
                return Err(Error::DesyncError(
                    self.name.clone(),
                    Desync::BrokenRemoteIndex,
                ));
            };

            let changed = *record.envelope != data.envelope
                || record.size != data.size
                || record.remote_order != data.remote_order
                || record.decode_error != data.decode_error;

            if changed {
                self.journal_record(uid);
                let Some(record) = self.records.get_mut(uid) else {
                    return Err(Error::DesyncError(
                        self.name.clone(),
                        Desync::BrokenRemoteIndex,
                    ));
                };

                record.envelope = Arc::new(data.envelope);
                record.size = data.size;
                record.remote_order = data.remote_order;
                record.decode_error = data.decode_error;
                record.modseq = modseq;
                self.bump_modseq();
                self.dirty.touch(uid);
                debug!(mailbox = %self.name, %uid, "refreshed message record");
            }

            return Ok(Upserted {
                uid,
                created: false,
            });
        }

        let uid = self.allocator.next_uid()?;
        let modseq = self.bump_modseq();
        self.journal_record(uid);

        let mut flags = data.flags.without_recent();
        flags.insert(Flag::Recent);
        if data.decode_error.is_some() {
            flags.insert(Flag::keyword(UNDECRYPTABLE));
        }

        let record = MessageRecord {
            remote_id: data.remote_id,
            uid,
            flags,
            size: data.size,
            envelope: Arc::new(data.envelope),
            remote_order: data.remote_order,
            modseq,
            decode_error: data.decode_error,
            local_changes: Default::default(),
        };

        if let Err(record) = self.records.push(record) {
            let remote_id = &record.remote_id;
            warn!(mailbox = %self.name, %uid, %remote_id, "cannot insert record");
            return Err(Error::DesyncError(
                self.name.clone(),
                Desync::UidNextRegression(uid),
            ));
        }

        self.dirty.touch(uid);
        debug!(mailbox = %self.name, %uid, "created message record");

        Ok(Upserted { uid, created: true })
    }

    /// Applies a flag delta to the record with the given UID, stamping
    /// every flag that changed as a local change.
    ///
    /// `\Recent` is managed by the server and is ignored in deltas.
    pub fn set_flags(&mut self, uid: Uid, delta: &Flags, mode: FlagMode) -> Result<MessageRecord> {
        let delta = delta.without_recent();
        let modseq = self.modseq.next();

        let Some(record) = self.records.get(uid) else {
            return Err(Error::UidNotFoundError(self.name.clone(), uid));
        };

        let mut flags = record.flags.clone();
        if !flags.apply(&delta, mode) {
            return Ok(record.clone());
        }

        self.journal_record(uid);
        let Some(record) = self.records.get_mut(uid) else {
            return Err(Error::UidNotFoundError(self.name.clone(), uid));
        };

        let at = Utc::now();
        for flag in record.flags.symmetric_difference_with(&flags) {
            record.local_changes.insert(flag, at);
        }
        record.flags = flags;
        record.modseq = modseq;
        let record = record.clone();

        self.bump_modseq();
        self.dirty.touch(uid);
        debug!(mailbox = %self.name, %uid, flags = %record.flags, "stored flags");

        Ok(record)
    }

    /// Folds remote flags taken at `at` into the record with the given
    /// remote id.
    ///
    /// Returns the UID of the record, or `None` if the remote id is
    /// unknown, and whether flags changed.
    pub fn merge_remote_flags(
        &mut self,
        remote_id: &str,
        flags: &Flags,
        at: DateTime<Utc>,
    ) -> Option<(Uid, bool)> {
        let uid = self.records.uid_of(remote_id)?;
        let modseq = self.modseq.next();
        let record = self.records.get(uid)?;

        let mut merged = merge::merge(&record.flags, &record.local_changes, flags, at);
        if record.is_undecryptable() {
            merged.insert(Flag::keyword(UNDECRYPTABLE));
        }

        let superseded = record.local_changes.values().any(|changed| *changed < at);
        if merged == record.flags && !superseded {
            return Some((uid, false));
        }

        self.journal_record(uid);
        let record = self.records.get_mut(uid)?;
        merge::prune(&mut record.local_changes, at);

        if merged == record.flags {
            return Some((uid, false));
        }

        record.flags = merged;
        record.modseq = modseq;
        self.bump_modseq();
        self.dirty.touch(uid);
        debug!(mailbox = %self.name, %uid, "merged remote flags");

        Some((uid, true))
    }

    /// Marks the record with the given remote id as `\Deleted` and
    /// queues it for expunge.
    pub fn mark_removed(&mut self, remote_id: &str) -> Option<Uid> {
        let uid = self.records.uid_of(remote_id)?;
        let modseq = self.modseq.next();

        if !self.records.get(uid)?.flags.is_deleted() {
            self.journal_record(uid);
            let record = self.records.get_mut(uid)?;
            record.flags.insert(Flag::Deleted);
            record.modseq = modseq;
            self.bump_modseq();
        }

        // the pending state is persisted with the record
        if self.pending_expunges.insert(uid) {
            self.dirty.touch(uid);
        }
        debug!(mailbox = %self.name, %uid, "queued remote removal");

        Some(uid)
    }

    /// Removes every record flagged `\Deleted`.
    ///
    /// Returns the removed UIDs in ascending order. Expunging twice is
    /// a no-op the second time.
    pub fn expunge(&mut self) -> Vec<Uid> {
        let removed = self.records.remove_where(|record| record.flags.is_deleted());
        self.forget(removed)
    }

    /// Removes the records queued by remote removals only.
    pub fn flush_pending_expunges(&mut self) -> Vec<Uid> {
        if self.pending_expunges.is_empty() {
            return Vec::new();
        }

        let pending = &self.pending_expunges;
        let removed = self.records.remove_where(|record| pending.contains(&record.uid));
        self.pending_expunges.clear();
        self.forget(removed)
    }

    /// Journals and forgets removed records, returning their UIDs.
    fn forget(&mut self, removed: Vec<MessageRecord>) -> Vec<Uid> {
        if removed.is_empty() {
            return Vec::new();
        }

        let uids: Vec<Uid> = removed.iter().map(|record| record.uid).collect();
        self.journal_removed(removed);

        for uid in &uids {
            self.pending_expunges.remove(uid);
            self.dirty.remove(*uid);
        }

        self.bump_modseq();
        debug!(mailbox = %self.name, count = uids.len(), "expunged message records");

        uids
    }

    /// Clears `\Recent` from records matching the given predicate.
    ///
    /// `\Recent` is session-relative: clearing it does not bump the
    /// modification sequence of records.
    pub fn clear_recent(&mut self, f: impl Fn(Uid) -> bool) -> u32 {
        let uids: Vec<Uid> = self
            .records
            .iter()
            .filter(|record| f(record.uid) && record.flags.is_recent())
            .map(|record| record.uid)
            .collect();

        for uid in &uids {
            self.journal_record(*uid);
            if let Some(record) = self.records.get_mut(*uid) {
                record.flags.remove(&Flag::Recent);
                self.dirty.touch(*uid);
            }
        }

        if !uids.is_empty() {
            self.state = None;
        }

        u32::try_from(uids.len()).unwrap_or(u32::MAX)
    }

    /// Checks the invariants of the mailbox.
    pub fn check_integrity(&self) -> Result<()> {
        let desync = |desync| Err(Error::DesyncError(self.name.clone(), desync));

        if let Some(uid) = self.records.duplicate_uid() {
            return desync(Desync::DuplicateUid(uid));
        }

        // an exhausted allocator has no uid next to regress
        let uid_next = self.allocator.raw_uid_next();
        if let (Some(max), Some(uid_next)) = (self.records.max_uid(), uid_next) {
            if uid_next <= max {
                return desync(Desync::UidNextRegression(max));
            }
        }

        if !self.records.remote_index_is_consistent() {
            return desync(Desync::BrokenRemoteIndex);
        }

        Ok(())
    }

    /// Raises `uid_next` above every assigned UID.
    pub fn repair_uid_next(&mut self) {
        if let Some(max) = self.records.max_uid() {
            self.allocator.raise_uid_next_above(max);
            self.state = None;
            self.dirty.mailbox = true;
            info!(mailbox = %self.name, uid_next = %self.allocator.uid_next(), "repaired uid next");
        }
    }

    /// Discards every record and bumps the UID validity.
    ///
    /// The cursor is dropped as well, so that the next sync starts
    /// with a full listing.
    pub fn invalidate(&mut self) -> UidValidity {
        let uid_validity = if self.allocator.raw_uid_next().is_some() {
            self.allocator.invalidate()
        } else {
            self.allocator.invalidate_and_reset()
        };

        if let Some(journal) = &mut self.journal {
            if journal.store.is_none() {
                journal.store = Some(self.records.clone());
            }
        }

        self.records.clear();
        self.pending_expunges.clear();
        self.cursor = None;
        self.bump_modseq();
        self.dirty = Dirty {
            mailbox: true,
            reset: true,
            ..Default::default()
        };

        uid_validity
    }

    /// Recomputes the cached aggregate.
    pub fn commit(&mut self) {
        if self.state.is_none() {
            self.state = Some(MailboxState::compute(
                &self.allocator,
                &self.records,
                self.modseq,
            ));
        }
    }

    /// Takes the changes made since the last call.
    pub fn take_dirty(&mut self) -> Dirty {
        std::mem::take(&mut self.dirty)
    }
}

/// Releases a selection registration when dropped.
#[derive(Debug)]
pub struct SelectionGuard {
    selected: Arc<AtomicUsize>,
}

impl Drop for SelectionGuard {
    fn drop(&mut self) {
        self.selected.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The shared handle of a mailbox.
///
/// Cloning the handle is cheap, all clones point to the same mailbox.
#[derive(Clone, Debug)]
pub struct MailboxHandle {
    name: Arc<str>,
    inner: Arc<RwLock<Mailbox>>,
    cache: Option<Arc<MailboxCache>>,
    selected: Arc<AtomicUsize>,
}

impl MailboxHandle {
    pub fn new(mailbox: Mailbox, cache: Option<Arc<MailboxCache>>) -> Self {
        Self {
            name: Arc::from(mailbox.name()),
            inner: Arc::new(RwLock::new(mailbox)),
            cache,
            selected: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the mailbox for reading. Readers never block each
    /// other, and only wait for an in-flight mutation.
    pub async fn read(&self) -> RwLockReadGuard<'_, Mailbox> {
        self.inner.read().await
    }

    pub async fn state(&self) -> MailboxState {
        self.read().await.state()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.read().await.snapshot()
    }

    pub async fn get(&self, uid: Uid) -> Option<MessageRecord> {
        self.read().await.get(uid).cloned()
    }

    /// Runs the given mutation inside the exclusive section of the
    /// mailbox.
    ///
    /// The mutation is applied in place and kept only if it succeeds
    /// and its changes are persisted. Otherwise it is rolled back
    /// before the lock is released.
    pub async fn mutate<T>(&self, f: impl FnOnce(&mut Mailbox) -> Result<T>) -> Result<T> {
        let mut mailbox = self.inner.write().await;
        mailbox.begin();

        let output = match f(&mut mailbox) {
            Ok(output) => output,
            Err(err) => {
                mailbox.rollback();
                return Err(err);
            }
        };

        mailbox.commit();
        let dirty = mailbox.take_dirty();

        if let Some(cache) = &self.cache {
            if !dirty.is_empty() {
                if let Err(err) = cache.save(&mailbox, &dirty) {
                    mailbox.rollback();
                    return Err(Error::PersistMailboxError(err, self.name.to_string()));
                }
            }
        }

        mailbox.end();
        Ok(output)
    }

    pub async fn set_flags(
        &self,
        uid: Uid,
        delta: &Flags,
        mode: FlagMode,
    ) -> Result<MessageRecord> {
        self.mutate(|mailbox| mailbox.set_flags(uid, delta, mode))
            .await
    }

    pub async fn expunge(&self) -> Result<Vec<Uid>> {
        self.mutate(|mailbox| Ok(mailbox.expunge())).await
    }

    pub async fn invalidate(&self) -> Result<UidValidity> {
        self.mutate(|mailbox| Ok(mailbox.invalidate())).await
    }

    /// Returns the number of sessions having the mailbox selected.
    pub fn selected_sessions(&self) -> usize {
        self.selected.load(Ordering::SeqCst)
    }

    pub(crate) fn register_selection(&self) -> SelectionGuard {
        self.selected.fetch_add(1, Ordering::SeqCst);
        SelectionGuard {
            selected: self.selected.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::{
        envelope::Envelope,
        flag::{Flag, FlagMode, Flags, UNDECRYPTABLE},
        uid::{Seqnum, Uid},
    };

    use super::{Desync, Error, Mailbox, MailboxHandle, MessageData};

    fn message(remote_id: &str, flags: &str) -> MessageData {
        MessageData {
            remote_id: remote_id.into(),
            flags: Flags::from(flags),
            size: 42,
            envelope: Envelope::default(),
            remote_order: 0,
            decode_error: None,
        }
    }

    #[test]
    fn upsert_allocates_once_per_remote_id() {
        let mut mailbox = Mailbox::new("INBOX");

        let a = mailbox.upsert(message("a", "")).unwrap();
        let b = mailbox.upsert(message("b", "\\Seen")).unwrap();
        let a_again = mailbox.upsert(message("a", "\\Seen")).unwrap();

        assert!(a.created && b.created && !a_again.created);
        assert_eq!(a.uid, a_again.uid);
        assert!(a.uid < b.uid);

        // known records keep their flags
        let record = mailbox.get(a.uid).unwrap();
        assert_eq!(record.flags, Flags::from_iter([Flag::Recent]));

        mailbox.commit();
        let state = mailbox.state();
        assert_eq!(state.exists, 2);
        assert_eq!(state.recent, 2);
        assert_eq!(state.uid_next.get(), 3);
        assert_eq!(state.unseen, Seqnum::of(1));
        assert_eq!(state.unseen_count, 1);
    }

    #[test]
    fn undecryptable_messages_get_a_keyword() {
        let mut mailbox = Mailbox::new("INBOX");
        let mut data = message("a", "");
        data.decode_error = Some("bad key".into());

        let uid = mailbox.upsert(data).unwrap().uid;
        let record = mailbox.get(uid).unwrap();

        assert!(record.is_undecryptable());
        assert!(record.flags.contains(&Flag::keyword(UNDECRYPTABLE)));

        // survives remote flag updates
        mailbox.merge_remote_flags("a", &Flags::from("\\Seen"), Utc::now());
        let record = mailbox.get(uid).unwrap();
        assert!(record.flags.contains(&Flag::keyword(UNDECRYPTABLE)));
    }

    #[test]
    fn set_flags_on_missing_uid() {
        let mut mailbox = Mailbox::new("INBOX");
        let err = mailbox
            .set_flags(Uid::MIN, &Flags::from("\\Seen"), FlagMode::Add)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn local_store_survives_stale_remote_update() {
        let mut mailbox = Mailbox::new("INBOX");
        let uid = mailbox.upsert(message("a", "")).unwrap().uid;
        let stale = Utc::now() - Duration::seconds(60);

        mailbox
            .set_flags(uid, &Flags::from("\\Seen"), FlagMode::Add)
            .unwrap();
        mailbox.merge_remote_flags("a", &Flags::default(), stale);

        assert!(mailbox.get(uid).unwrap().flags.is_seen());

        let fresh = Utc::now() + Duration::seconds(60);
        mailbox.merge_remote_flags("a", &Flags::default(), fresh);
        assert!(!mailbox.get(uid).unwrap().flags.is_seen());
    }

    #[test]
    fn expunge_is_idempotent() {
        let mut mailbox = Mailbox::new("INBOX");
        let a = mailbox.upsert(message("a", "")).unwrap().uid;
        let b = mailbox.upsert(message("b", "")).unwrap().uid;
        let c = mailbox.upsert(message("c", "")).unwrap().uid;

        mailbox.set_flags(c, &Flags::from("\\Deleted"), FlagMode::Add).unwrap();
        mailbox.set_flags(a, &Flags::from("\\Deleted"), FlagMode::Add).unwrap();

        assert_eq!(mailbox.expunge(), vec![a, c]);
        assert_eq!(mailbox.expunge(), vec![]);
        assert_eq!(mailbox.records().len(), 1);
        assert!(mailbox.get(b).is_some());
        assert_eq!(mailbox.state().uid_next.get(), 4);
    }

    #[test]
    fn remote_removals_wait_for_flush() {
        let mut mailbox = Mailbox::new("INBOX");
        let a = mailbox.upsert(message("a", "")).unwrap().uid;
        mailbox.upsert(message("b", "\\Deleted")).unwrap();

        assert_eq!(mailbox.mark_removed("a"), Some(a));
        assert_eq!(mailbox.mark_removed("unknown"), None);
        assert_eq!(mailbox.records().len(), 2);

        // only the remote removal is flushed
        assert_eq!(mailbox.flush_pending_expunges(), vec![a]);
        assert_eq!(mailbox.records().len(), 1);
        assert!(mailbox.pending_expunges().is_empty());
    }

    #[test]
    fn integrity_check_and_repair() {
        let mut mailbox = Mailbox::new("INBOX");
        mailbox.upsert(message("a", "")).unwrap();
        mailbox.upsert(message("b", "")).unwrap();
        assert!(mailbox.check_integrity().is_ok());

        mailbox.allocator = super::UidAllocator::restore(
            mailbox.allocator.current_validity(),
            Uid::of(2),
        );

        match mailbox.check_integrity() {
            Err(Error::DesyncError(_, desync)) => {
                assert_eq!(desync, Desync::UidNextRegression(Uid::of(2).unwrap()));
                assert!(desync.is_repairable());
            }
            res => panic!("expected desync, got {res:?}"),
        }

        mailbox.repair_uid_next();
        assert!(mailbox.check_integrity().is_ok());
        assert_eq!(mailbox.state().uid_next.get(), 3);
    }

    #[test]
    fn invalidate_keeps_uid_next() {
        let mut mailbox = Mailbox::new("INBOX");
        mailbox.upsert(message("a", "")).unwrap();
        mailbox.set_cursor(Some("cursor".into()));

        let prev = mailbox.state();
        let uid_validity = mailbox.invalidate();
        mailbox.commit();
        let next = mailbox.state();

        assert!(uid_validity > prev.uid_validity);
        assert_eq!(next.uid_validity, uid_validity);
        assert_eq!(next.exists, 0);
        assert!(next.uid_next >= prev.uid_next);
        assert_eq!(mailbox.cursor(), None);
        assert!(mailbox.take_dirty().reset);
    }

    #[test_log::test(tokio::test)]
    async fn failed_mutation_leaves_mailbox_untouched() {
        let handle = MailboxHandle::new(Mailbox::new("INBOX"), None);

        let res = handle
            .mutate(|mailbox| {
                mailbox.upsert(message("a", ""))?;
                mailbox.set_flags(Uid::MAX, &Flags::from("\\Seen"), FlagMode::Add)
            })
            .await;

        assert!(res.is_err());
        assert_eq!(handle.state().await.exists, 0);
        assert_eq!(handle.state().await.uid_next, Uid::MIN);
    }

    #[test_log::test(tokio::test)]
    async fn rollback_restores_records_and_state() {
        let handle = MailboxHandle::new(Mailbox::new("INBOX"), None);
        let (a, b) = handle
            .mutate(|mailbox| {
                let a = mailbox.upsert(message("a", ""))?.uid;
                let b = mailbox.upsert(message("b", ""))?.uid;
                mailbox.set_cursor(Some("1".into()));
                Ok((a, b))
            })
            .await
            .unwrap();
        let state = handle.state().await;

        let res = handle
            .mutate(|mailbox| {
                mailbox.set_flags(a, &Flags::from("\\Seen"), FlagMode::Add)?;
                mailbox.set_flags(b, &Flags::from("\\Deleted"), FlagMode::Add)?;
                mailbox.expunge();
                mailbox.invalidate();
                mailbox.upsert(message("c", ""))?;
                mailbox.set_flags(Uid::MAX, &Flags::from("\\Seen"), FlagMode::Add)
            })
            .await;
        assert!(res.is_err());

        let mailbox = handle.read().await;
        assert_eq!(mailbox.state(), state);
        assert_eq!(mailbox.cursor(), Some("1"));
        assert_eq!(mailbox.records().len(), 2);
        assert_eq!(mailbox.records().uid_of("c"), None);
        assert!(!mailbox.get(a).unwrap().flags.is_seen());
        assert!(!mailbox.get(b).unwrap().flags.is_deleted());
        assert!(mailbox.check_integrity().is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn selection_guard_releases_on_drop() {
        let handle = MailboxHandle::new(Mailbox::new("INBOX"), None);

        let guard = handle.register_selection();
        let other = handle.clone().register_selection();
        assert_eq!(handle.selected_sessions(), 2);

        drop(guard);
        drop(other);
        assert_eq!(handle.selected_sessions(), 0);
    }
}
