//! # UID allocator
//!
//! Module dedicated to UID allocation. The [`UidAllocator`] issues
//! strictly increasing UIDs and owns the UIDVALIDITY epoch of a
//! mailbox. It lives inside the [`Mailbox`](super::Mailbox), which
//! makes allocations serialized by the per-mailbox mutation section.

use tracing::{debug, info};

use crate::uid::{Uid, UidValidity};

use super::{Error, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UidAllocator {
    uid_validity: UidValidity,

    /// Strictly greater than every UID issued in the current epoch.
    ///
    /// `None` once [`Uid::MAX`] has been issued.
    uid_next: Option<Uid>,
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl UidAllocator {
    /// Creates an allocator for a brand new mailbox.
    pub fn new() -> Self {
        Self {
            uid_validity: UidValidity::initial(),
            uid_next: Some(Uid::MIN),
        }
    }

    /// Restores an allocator from persisted values.
    pub fn restore(uid_validity: UidValidity, uid_next: Option<Uid>) -> Self {
        Self {
            uid_validity,
            uid_next,
        }
    }

    /// Issues a fresh UID and advances `uid_next`.
    pub fn next_uid(&mut self) -> Result<Uid> {
        let uid = self.uid_next.ok_or(Error::UidSpaceExhaustedError)?;
        self.uid_next = uid.next();
        debug!(%uid, "allocated uid");
        Ok(uid)
    }

    pub fn current_validity(&self) -> UidValidity {
        self.uid_validity
    }

    /// Returns the predicted UID of the next message, saturating at
    /// [`Uid::MAX`] once the UID space is exhausted.
    pub fn uid_next(&self) -> Uid {
        self.uid_next.unwrap_or(Uid::MAX)
    }

    pub(crate) fn raw_uid_next(&self) -> Option<Uid> {
        self.uid_next
    }

    /// Discards the current epoch and bumps the UID validity to a
    /// value never used before.
    ///
    /// `uid_next` is kept so that UIDs keep growing across epochs.
    pub fn invalidate(&mut self) -> UidValidity {
        let prev = self.uid_validity;
        self.uid_validity = prev.next();
        info!(%prev, next = %self.uid_validity, "invalidated uid validity");
        self.uid_validity
    }

    /// Same as [`UidAllocator::invalidate`], but restarts UIDs from
    /// [`Uid::MIN`]. Only used once the UID space is exhausted.
    pub fn invalidate_and_reset(&mut self) -> UidValidity {
        self.uid_next = Some(Uid::MIN);
        self.invalidate()
    }

    /// Raises `uid_next` above the given UID, if needed.
    pub(crate) fn raise_uid_next_above(&mut self, uid: Uid) {
        if let Some(uid_next) = self.uid_next {
            if uid_next <= uid {
                self.uid_next = uid.next();
            }
        }
    }
}
