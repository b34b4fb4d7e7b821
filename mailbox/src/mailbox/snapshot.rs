//! # Mailbox snapshot
//!
//! Module dedicated to the frozen sequence number view of a session.
//! A [`Snapshot`] is an owned copy of the mailbox membership taken at
//! selection time. It only changes when its owner acknowledges
//! changes, which keeps sequence numbers stable within a command
//! sequence.

use std::sync::Arc;

use crate::{
    envelope::Envelope,
    flag::Flags,
    uid::{ModSeq, Seqnum, Uid, UidValidity},
};

use super::record::MessageRecord;

/// A message as seen by a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotEntry {
    pub uid: Uid,
    pub flags: Flags,
    pub size: u32,
    pub envelope: Arc<Envelope>,
    pub modseq: ModSeq,
}

impl From<&MessageRecord> for SnapshotEntry {
    fn from(record: &MessageRecord) -> Self {
        Self {
            uid: record.uid,
            flags: record.flags.clone(),
            size: record.size,
            envelope: record.envelope.clone(),
            modseq: record.modseq,
        }
    }
}

/// The ordered sequence of `(sequence number, UID, flags)` of a
/// mailbox at a point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    uid_validity: UidValidity,
    modseq: ModSeq,
    entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    pub(crate) fn new(
        uid_validity: UidValidity,
        modseq: ModSeq,
        entries: Vec<SnapshotEntry>,
    ) -> Self {
        Self {
            uid_validity,
            modseq,
            entries,
        }
    }

    /// The UID validity the snapshot was taken under.
    pub fn uid_validity(&self) -> UidValidity {
        self.uid_validity
    }

    /// The highest modification sequence acknowledged by the
    /// snapshot.
    pub fn modseq(&self) -> ModSeq {
        self.modseq
    }

    pub(crate) fn set_modseq(&mut self, modseq: ModSeq) {
        self.modseq = modseq;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries with their sequence number.
    pub fn iter(&self) -> impl Iterator<Item = (Seqnum, &SnapshotEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(ix, entry)| (Seqnum::from_index(ix), entry))
    }

    pub fn get(&self, seqnum: Seqnum) -> Option<&SnapshotEntry> {
        self.entries.get(seqnum.to_index())
    }

    pub fn seqnum_of(&self, uid: Uid) -> Option<Seqnum> {
        self.position(uid).map(Seqnum::from_index)
    }

    pub fn uid_at(&self, seqnum: Seqnum) -> Option<Uid> {
        self.get(seqnum).map(|entry| entry.uid)
    }

    pub fn max_uid(&self) -> Option<Uid> {
        self.entries.last().map(|entry| entry.uid)
    }

    /// The greatest sequence number, used as `*` in sequence sets.
    pub fn max_seqnum(&self) -> Option<Seqnum> {
        self.entries.len().checked_sub(1).map(Seqnum::from_index)
    }

    fn position(&self, uid: Uid) -> Option<usize> {
        self.entries
            .binary_search_by_key(&uid, |entry| entry.uid)
            .ok()
    }

    pub(crate) fn get_mut(&mut self, uid: Uid) -> Option<&mut SnapshotEntry> {
        self.position(uid).map(|ix| &mut self.entries[ix])
    }

    /// Appends an entry whose UID is greater than every UID of the
    /// snapshot. Out of order entries are ignored.
    pub(crate) fn push(&mut self, entry: SnapshotEntry) -> bool {
        if self.max_uid().map_or(true, |max| max < entry.uid) {
            self.entries.push(entry);
            true
        } else {
            false
        }
    }

    /// Removes entries whose UID is not alive anymore.
    ///
    /// Returns the removed entries in ascending UID order, each paired
    /// with the sequence number it has at the time its `EXPUNGE`
    /// response is emitted, responses being emitted in that order.
    pub(crate) fn remove_vanished(&mut self, alive: impl Fn(Uid) -> bool) -> Vec<(Seqnum, Uid)> {
        let mut expunged = Vec::new();
        let mut ix = 0;

        self.entries.retain(|entry| {
            ix += 1;

            if alive(entry.uid) {
                true
            } else {
                let seqnum = ix - expunged.len();
                expunged.push((Seqnum::from_index(seqnum - 1), entry.uid));
                false
            }
        });

        expunged
    }
}
