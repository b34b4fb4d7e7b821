//! # Resync patch
//!
//! Module dedicated to the full resync diff. The core function of the
//! module is [`build`], which compares local records with a full
//! remote listing by remote id and returns the [`ResyncHunk`]s needed
//! to make the local side match the remote one.

use std::{collections::HashSet, fmt};

use crate::{
    flag::{Flag, Flags, UNDECRYPTABLE},
    mailbox::{RecordStore, RemoteId},
    remote::RemoteMessage,
};

/// The resync hunk.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ResyncHunk {
    /// The remote message is unknown locally and needs a record.
    Create(RemoteId),

    /// The remote message is known locally but flags differ, the
    /// remote flags need to be merged.
    UpdateFlags(RemoteId, Flags),

    /// The local record is not listed remotely anymore.
    Remove(RemoteId),
}

impl ResyncHunk {
    pub fn remote_id(&self) -> &str {
        match self {
            Self::Create(id) => id,
            Self::UpdateFlags(id, _) => id,
            Self::Remove(id) => id,
        }
    }
}

impl fmt::Display for ResyncHunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(id) => write!(f, "Creating record for remote message {id}"),
            Self::UpdateFlags(id, flags) => {
                write!(f, "Merging flags {flags} of remote message {id}")
            }
            Self::Remove(id) => write!(f, "Removing record of remote message {id}"),
        }
    }
}

/// Server-managed flags, never compared with remote flags.
fn comparable(flags: &Flags) -> Flags {
    flags
        .iter()
        .filter(|flag| match flag {
            Flag::Recent => false,
            Flag::Keyword(keyword) => keyword != UNDECRYPTABLE,
            _ => true,
        })
        .cloned()
        .collect()
}

/// Builds the resync patch.
///
/// Hunks are ordered removals first, then flag updates, then
/// creations in remote order, so that UIDs of created records follow
/// the remote arrival order. Remote messages listed twice are only
/// taken once.
pub fn build(local: &RecordStore, remote: &[RemoteMessage]) -> Vec<ResyncHunk> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(remote.len());
    let mut creations: Vec<&RemoteMessage> = Vec::new();
    let mut updates = Vec::new();

    for message in remote {
        if !seen.insert(message.id.as_str()) {
            continue;
        }

        match local.get_by_remote_id(&message.id) {
            None => creations.push(message),
            Some(record) if comparable(&record.flags) != comparable(&message.flags) => {
                updates.push(ResyncHunk::UpdateFlags(
                    message.id.clone(),
                    message.flags.clone(),
                ));
            }
            Some(_) => (),
        }
    }

    creations.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

    local
        .iter()
        .filter(|record| !seen.contains(record.remote_id.as_str()))
        .filter(|record| !record.flags.is_deleted())
        .map(|record| ResyncHunk::Remove(record.remote_id.clone()))
        .chain(updates)
        .chain(
            creations
                .into_iter()
                .map(|message| ResyncHunk::Create(message.id.clone())),
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        envelope::Envelope,
        flag::{Flag, Flags, UNDECRYPTABLE},
        mailbox::{MessageRecord, RecordStore},
        remote::{RemoteMessage, RemotePayload},
        uid::{ModSeq, Uid},
    };

    use super::ResyncHunk;

    fn record(remote_id: &str, uid: u32, flags: &str) -> MessageRecord {
        MessageRecord {
            remote_id: remote_id.into(),
            uid: Uid::of(uid).unwrap(),
            flags: Flags::from(flags),
            size: 0,
            envelope: Arc::new(Envelope::default()),
            remote_order: 0,
            modseq: ModSeq::default(),
            decode_error: None,
            local_changes: Default::default(),
        }
    }

    fn remote(id: &str, order: u64, flags: &str) -> RemoteMessage {
        RemoteMessage {
            id: id.into(),
            order,
            flags: Flags::from(flags),
            size: 0,
            payload: RemotePayload::Plain(Envelope::default()),
        }
    }

    #[test]
    fn build_patch() {
        let mut undecryptable = record("d", 4, "\\Seen");
        undecryptable
            .flags
            .insert(Flag::keyword(UNDECRYPTABLE));

        let local = RecordStore::from_records([
            record("a", 1, "\\Seen \\Recent"),
            record("b", 2, ""),
            record("c", 3, "\\Deleted"),
            undecryptable,
        ]);

        let patch = super::build(
            &local,
            &[
                remote("f", 9, ""),
                remote("a", 1, "\\Seen"),
                remote("b", 2, "\\Flagged"),
                remote("d", 4, "\\Seen"),
                remote("e", 5, ""),
                remote("e", 5, ""),
            ],
        );

        assert_eq!(
            patch,
            vec![
                ResyncHunk::UpdateFlags("b".into(), Flags::from("\\Flagged")),
                ResyncHunk::Create("e".into()),
                ResyncHunk::Create("f".into()),
            ]
        );
    }

    #[test]
    fn local_only_records_are_removed() {
        let local = RecordStore::from_records([record("a", 1, ""), record("b", 2, "")]);
        let patch = super::build(&local, &[remote("b", 2, "")]);
        assert_eq!(patch, vec![ResyncHunk::Remove("a".into())]);
    }
}
