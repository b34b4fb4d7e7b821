//! # Sync report
//!
//! Module dedicated to the synchronization report.

use std::fmt;

use crate::uid::Uid;

/// The synchronization report.
///
/// Describes what a batch or a full resync did to a mailbox.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    /// The number of records created.
    pub created: usize,

    /// The number of records whose flags or envelope changed.
    pub updated: usize,

    /// The number of records marked as removed.
    pub removed: usize,

    /// The number of events targeting unknown messages, or ignored
    /// because of permissions.
    pub skipped: usize,

    /// The UIDs expunged right away, because no session had the
    /// mailbox selected.
    pub expunged: Vec<Uid>,

    /// Whether a full resync ran.
    pub resynced: bool,

    /// Whether the mailbox UID validity changed.
    pub invalidated: bool,
}

impl SyncReport {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.created == 0
            && self.updated == 0
            && self.removed == 0
            && self.expunged.is_empty()
            && !self.invalidated
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} removed, {} skipped, {} expunged",
            self.created,
            self.updated,
            self.removed,
            self.skipped,
            self.expunged.len(),
        )?;

        if self.invalidated {
            write!(f, " (invalidated)")?;
        } else if self.resynced {
            write!(f, " (resynced)")?;
        }

        Ok(())
    }
}
