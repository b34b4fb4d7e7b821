//! Module dedicated to the remote flags merge rule.
//!
//! A remote flag update is never blindly applied: a flag changed
//! locally by an IMAP client wins over a remote snapshot of the same
//! flag, unless the remote snapshot is newer than the local change.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::{Flag, Flags};

/// When flags were last changed locally, for changes not yet
/// superseded by a remote update.
pub type LocalChanges = BTreeMap<Flag, DateTime<Utc>>;

/// Folds remote flags taken at `remote_at` into the local flags.
///
/// For every flag known by either side, the local presence is kept
/// when the flag was changed locally at or after `remote_at`,
/// otherwise the remote presence wins. [`Flag::Recent`] is never
/// taken from the remote side.
pub fn merge(
    local: &Flags,
    changes: &LocalChanges,
    remote: &Flags,
    remote_at: DateTime<Utc>,
) -> Flags {
    let mut all_flags: BTreeSet<&Flag> = BTreeSet::new();
    all_flags.extend(local.iter());
    all_flags.extend(remote.iter());

    all_flags
        .into_iter()
        .filter(|flag| match flag {
            Flag::Recent => local.contains(*flag),
            flag => match changes.get(*flag) {
                Some(changed_at) if *changed_at >= remote_at => local.contains(*flag),
                _ => remote.contains(*flag),
            },
        })
        .cloned()
        .collect()
}

/// Drops local changes superseded by a remote update taken at
/// `remote_at`.
pub fn prune(changes: &mut LocalChanges, remote_at: DateTime<Utc>) {
    changes.retain(|_, changed_at| *changed_at >= remote_at)
}
