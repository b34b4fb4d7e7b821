//! # Mailbox state
//!
//! Module dedicated to the mailbox aggregate reported on selection.

use crate::uid::{ModSeq, Seqnum, Uid, UidValidity};

use super::{allocator::UidAllocator, record::RecordStore};

/// The mailbox state aggregate.
///
/// Recomputed once per committed mutation and cached in the mailbox,
/// so that readers always get values taken at the same point in time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxState {
    /// The current UID validity.
    /// `* OK [UIDVALIDITY uid_validity]`
    pub uid_validity: UidValidity,

    /// The predicted UID of the next message.
    /// `* OK [UIDNEXT uid_next]`
    pub uid_next: Uid,

    /// The number of messages.
    /// `* exists EXISTS`
    pub exists: u32,

    /// The number of messages flagged `\Recent`.
    /// `* recent RECENT`
    pub recent: u32,

    /// The sequence number of the first message without `\Seen`, in
    /// ascending UID order. `None` if all messages are seen.
    /// `* OK [UNSEEN unseen]`
    pub unseen: Option<Seqnum>,

    /// The number of messages without `\Seen`, as reported by
    /// `STATUS (UNSEEN)`.
    pub unseen_count: u32,

    /// The highest modification sequence of the mailbox.
    pub highest_modseq: ModSeq,
}

impl MailboxState {
    pub(crate) fn compute(
        allocator: &UidAllocator,
        records: &RecordStore,
        highest_modseq: ModSeq,
    ) -> Self {
        let mut recent = 0;
        let mut unseen = None;
        let mut unseen_count = 0;

        for (ix, record) in records.iter().enumerate() {
            if record.flags.is_recent() {
                recent += 1;
            }

            if !record.flags.is_seen() {
                unseen_count += 1;
                unseen.get_or_insert_with(|| Seqnum::from_index(ix));
            }
        }

        Self {
            uid_validity: allocator.current_validity(),
            uid_next: allocator.uid_next(),
            exists: u32::try_from(records.len()).unwrap_or(u32::MAX),
            recent,
            unseen,
            unseen_count,
            highest_modseq,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        envelope::Envelope,
        flag::Flags,
        mailbox::{MessageRecord, RecordStore, UidAllocator},
        uid::{ModSeq, Seqnum, Uid, UidValidity},
    };

    use super::MailboxState;

    fn record(uid: u32, flags: &str) -> MessageRecord {
        MessageRecord {
            remote_id: uid.to_string(),
            uid: Uid::of(uid).unwrap(),
            flags: Flags::from(flags),
            size: 0,
            envelope: Arc::new(Envelope::default()),
            remote_order: 0,
            modseq: ModSeq(1),
            decode_error: None,
            local_changes: Default::default(),
        }
    }

    #[test]
    fn compute() {
        let allocator = UidAllocator::restore(UidValidity::initial(), Uid::of(8));
        let records = RecordStore::from_records([
            record(2, "\\Seen \\Recent"),
            record(5, "\\Recent"),
            record(7, ""),
        ]);

        let state = MailboxState::compute(&allocator, &records, ModSeq(3));

        assert_eq!(state.exists, 3);
        assert_eq!(state.recent, 2);
        assert_eq!(state.unseen, Seqnum::of(2));
        assert_eq!(state.unseen_count, 2);
        assert_eq!(state.uid_next, Uid::of(8).unwrap());
        assert_eq!(state.highest_modseq, ModSeq(3));
    }

    #[test]
    fn compute_all_seen() {
        let records = RecordStore::from_records([record(1, "\\Seen")]);
        let state = MailboxState::compute(&UidAllocator::new(), &records, ModSeq(1));
        assert_eq!(state.unseen, None);
        assert_eq!(state.unseen_count, 0);
    }
}
