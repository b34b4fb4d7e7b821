//! # Message record store
//!
//! Module dedicated to message records. The [`RecordStore`] is an
//! arena of [`MessageRecord`]s kept in ascending UID order, indexed
//! by remote identifier. Records are referenced by value (UID or
//! remote id) from sessions and from the sync engine, never by
//! pointer.

use std::{collections::HashMap, slice, sync::Arc};

use crate::{
    envelope::Envelope,
    flag::{merge::LocalChanges, Flags},
    uid::{ModSeq, Seqnum, Uid},
};

/// Alias for the opaque identifier of a message on the remote
/// account.
pub type RemoteId = String;

/// The message record.
///
/// One per message currently visible in a mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageRecord {
    /// The identifier of the message on the remote account.
    pub remote_id: RemoteId,

    /// The UID, assigned once for the life of the record.
    pub uid: Uid,

    /// The current flags.
    pub flags: Flags,

    /// The size of the message, in bytes.
    pub size: u32,

    /// The cached envelope, shared with session snapshots.
    pub envelope: Arc<Envelope>,

    /// The remote monotonic order of the message.
    pub remote_order: u64,

    /// The modification sequence of the last write.
    pub modseq: ModSeq,

    /// The reason why the message could not be decrypted, if any.
    pub decode_error: Option<String>,

    /// Flags changed locally and not yet superseded by a remote
    /// update. Not persisted.
    pub(crate) local_changes: LocalChanges,
}

impl MessageRecord {
    pub fn is_undecryptable(&self) -> bool {
        self.decode_error.is_some()
    }
}

/// The arena of message records.
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    /// Records sorted by ascending UID.
    records: Vec<MessageRecord>,

    /// Index of UIDs by remote identifier.
    by_remote_id: HashMap<RemoteId, Uid>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from records of any order.
    ///
    /// No deduplication is made: duplicates are left for the
    /// integrity check to find.
    pub fn from_records(records: impl IntoIterator<Item = MessageRecord>) -> Self {
        let mut records: Vec<MessageRecord> = records.into_iter().collect();
        records.sort_by_key(|record| record.uid);

        let by_remote_id = records
            .iter()
            .map(|record| (record.remote_id.clone(), record.uid))
            .collect();

        Self {
            records,
            by_remote_id,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, MessageRecord> {
        self.records.iter()
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.records.last().map(|record| record.uid)
    }

    fn position(&self, uid: Uid) -> Option<usize> {
        self.records
            .binary_search_by_key(&uid, |record| record.uid)
            .ok()
    }

    pub fn get(&self, uid: Uid) -> Option<&MessageRecord> {
        self.position(uid).map(|ix| &self.records[ix])
    }

    pub(crate) fn get_mut(&mut self, uid: Uid) -> Option<&mut MessageRecord> {
        self.position(uid).map(|ix| &mut self.records[ix])
    }

    pub fn uid_of(&self, remote_id: &str) -> Option<Uid> {
        self.by_remote_id.get(remote_id).copied()
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Option<&MessageRecord> {
        self.uid_of(remote_id).and_then(|uid| self.get(uid))
    }

    /// Returns the record at the given position of the current
    /// ascending UID order.
    pub fn get_at(&self, seqnum: Seqnum) -> Option<&MessageRecord> {
        self.records.get(seqnum.to_index())
    }

    /// Returns the current position of the given UID.
    pub fn seqnum_of(&self, uid: Uid) -> Option<Seqnum> {
        self.position(uid).map(Seqnum::from_index)
    }

    /// Appends a record whose UID is greater than every UID of the
    /// store.
    ///
    /// Returns the record back if the UID or the remote identifier is
    /// already known.
    pub(crate) fn push(&mut self, record: MessageRecord) -> Result<(), MessageRecord> {
        let ordered = self.max_uid().map_or(true, |max| max < record.uid);
        if !ordered || self.by_remote_id.contains_key(&record.remote_id) {
            return Err(record);
        }

        self.by_remote_id
            .insert(record.remote_id.clone(), record.uid);
        self.records.push(record);
        Ok(())
    }

    /// Removes the records matching the given predicate, and returns
    /// them in ascending UID order.
    pub(crate) fn remove_where(
        &mut self,
        mut f: impl FnMut(&MessageRecord) -> bool,
    ) -> Vec<MessageRecord> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.records).into_iter().partition(|record| f(record));
        self.records = kept;

        for record in &removed {
            self.by_remote_id.remove(&record.remote_id);
        }

        removed
    }

    /// Puts the given record back at its UID position, replacing the
    /// record holding the same UID if any.
    pub(crate) fn restore(&mut self, record: MessageRecord) {
        match self.position(record.uid) {
            Some(ix) => {
                let prev = std::mem::replace(&mut self.records[ix], record);
                self.by_remote_id.remove(&prev.remote_id);
                let record = &self.records[ix];
                self.by_remote_id
                    .insert(record.remote_id.clone(), record.uid);
            }
            None => {
                let ix = self
                    .records
                    .partition_point(|other| other.uid < record.uid);
                self.by_remote_id
                    .insert(record.remote_id.clone(), record.uid);
                self.records.insert(ix, record);
            }
        }
    }

    /// Removes the record with the given UID.
    pub(crate) fn remove(&mut self, uid: Uid) -> Option<MessageRecord> {
        let record = self.records.remove(self.position(uid)?);
        self.by_remote_id.remove(&record.remote_id);
        Some(record)
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
        self.by_remote_id.clear();
    }

    /// Returns `true` if the remote index points at every record and
    /// only at them.
    pub(crate) fn remote_index_is_consistent(&self) -> bool {
        self.by_remote_id.len() == self.records.len()
            && self.records.iter().all(|record| {
                self.by_remote_id.get(&record.remote_id) == Some(&record.uid)
            })
    }

    /// Returns the first UID found twice, if any.
    pub(crate) fn duplicate_uid(&self) -> Option<Uid> {
        self.records
            .windows(2)
            .find(|pair| pair[0].uid == pair[1].uid)
            .map(|pair| pair[0].uid)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        envelope::Envelope,
        flag::{Flag, Flags},
        uid::{ModSeq, Seqnum, Uid},
    };

    use super::{MessageRecord, RecordStore};

    fn record(remote_id: &str, uid: u32) -> MessageRecord {
        MessageRecord {
            remote_id: remote_id.into(),
            uid: Uid::of(uid).unwrap(),
            flags: Flags::default(),
            size: 0,
            envelope: Arc::new(Envelope::default()),
            remote_order: 0,
            modseq: ModSeq::default(),
            decode_error: None,
            local_changes: Default::default(),
        }
    }

    #[test]
    fn lookups() {
        let store = RecordStore::from_records([record("b", 4), record("a", 2), record("c", 9)]);

        assert_eq!(store.len(), 3);
        assert_eq!(store.uid_of("b"), Uid::of(4));
        assert_eq!(store.get_at(Seqnum::MIN).unwrap().remote_id, "a");
        assert_eq!(store.seqnum_of(Uid::of(9).unwrap()), Seqnum::of(3));
        assert_eq!(store.get(Uid::of(3).unwrap()), None);
        assert_eq!(store.max_uid(), Uid::of(9));
        assert!(store.remote_index_is_consistent());
    }

    #[test]
    fn push_rejects_out_of_order_and_duplicates() {
        let mut store = RecordStore::from_records([record("a", 2)]);

        assert!(store.push(record("b", 1)).is_err());
        assert!(store.push(record("a", 3)).is_err());
        assert!(store.push(record("b", 3)).is_ok());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_where_returns_ascending_uids() {
        let mut deleted = record("c", 3);
        deleted.flags.insert(Flag::Deleted);
        let mut deleted_too = record("a", 1);
        deleted_too.flags.insert(Flag::Deleted);

        let mut store = RecordStore::from_records([deleted, record("b", 2), deleted_too]);
        let removed: Vec<Uid> = store
            .remove_where(|record| record.flags.is_deleted())
            .into_iter()
            .map(|record| record.uid)
            .collect();

        assert_eq!(removed, vec![Uid::of(1).unwrap(), Uid::of(3).unwrap()]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.uid_of("a"), None);
        assert!(store.remote_index_is_consistent());
    }

    #[test]
    fn restore_and_remove_keep_order() {
        let mut store = RecordStore::from_records([record("a", 1), record("c", 5)]);

        store.restore(record("b", 3));
        let mut flagged = record("c", 5);
        flagged.flags.insert(Flag::Flagged);
        store.restore(flagged);

        let uids: Vec<u32> = store.iter().map(|record| record.uid.get()).collect();
        assert_eq!(uids, vec![1, 3, 5]);
        assert!(store.get(Uid::of(5).unwrap()).unwrap().flags.contains(&Flag::Flagged));
        assert!(store.remote_index_is_consistent());

        assert_eq!(store.remove(Uid::of(3).unwrap()).unwrap().remote_id, "b");
        assert_eq!(store.remove(Uid::of(3).unwrap()), None);
        assert_eq!(store.uid_of("b"), None);
        assert!(store.remote_index_is_consistent());
    }

    #[test]
    fn detects_duplicates() {
        let store = RecordStore::from_records([record("a", 2), record("b", 2)]);
        assert_eq!(store.duplicate_uid(), Uid::of(2));
    }
}
