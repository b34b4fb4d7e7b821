//! # Identifiers
//!
//! Module dedicated to IMAP identifiers: [`Uid`], [`Seqnum`],
//! [`UidValidity`] and [`ModSeq`].

use std::{fmt, num::NonZeroU32};

use chrono::Utc;

/// The unique identifier of a message within a mailbox.
///
/// A UID is never zero, is assigned once and never reused within a
/// [`UidValidity`] epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(NonZeroU32);

impl Uid {
    pub const MIN: Self = Uid(NonZeroU32::MIN);
    pub const MAX: Self = Uid(NonZeroU32::MAX);

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Returns the following UID, or `None` if the UID space is
    /// exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Uid)
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> Self {
        uid.get()
    }
}

impl From<Uid> for NonZeroU32 {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", self.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// The sequence number of a message.
///
/// A sequence number is the 1-based position of a message in the
/// ascending UID order of a point-in-time snapshot. It is never
/// stored and only makes sense relative to a session snapshot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqnum(NonZeroU32);

impl Seqnum {
    pub const MIN: Self = Seqnum(NonZeroU32::MIN);
    pub const MAX: Self = Seqnum(NonZeroU32::MAX);

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn to_index(self) -> usize {
        self.get() as usize - 1
    }

    /// Builds a sequence number from a 0-based index, saturating at
    /// [`Seqnum::MAX`].
    pub fn from_index(ix: usize) -> Self {
        u32::try_from(ix + 1)
            .ok()
            .and_then(Seqnum::of)
            .unwrap_or(Seqnum::MAX)
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> Self {
        seqnum.get()
    }
}

impl From<Seqnum> for NonZeroU32 {
    fn from(seqnum: Seqnum) -> Self {
        seqnum.0
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seqnum({})", self.get())
    }
}

impl fmt::Display for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// The UID validity epoch of a mailbox.
///
/// A change of UID validity tells clients that every UID they cached
/// for the mailbox is void.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UidValidity(NonZeroU32);

impl UidValidity {
    pub fn of(validity: u32) -> Option<Self> {
        NonZeroU32::new(validity).map(UidValidity)
    }

    /// Builds the first UID validity of a mailbox, based on the
    /// current timestamp.
    pub fn initial() -> Self {
        let now = u32::try_from(Utc::now().timestamp()).unwrap_or(u32::MAX);
        Self::of(now).unwrap_or(UidValidity(NonZeroU32::MIN))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Builds a UID validity strictly greater than this one.
    ///
    /// The current timestamp is used when it is ahead, so that a
    /// mailbox recreated from scratch never reuses an old epoch.
    /// Saturates at `u32::MAX`.
    pub fn next(self) -> Self {
        let bumped = self.get().saturating_add(1);
        let now = Self::initial().get();
        UidValidity(NonZeroU32::new(bumped.max(now)).unwrap_or(NonZeroU32::MAX))
    }
}

impl fmt::Display for UidValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// The modification sequence of a mailbox.
///
/// Bumped on every local or remote write, and stamped on the record
/// that changed. Sessions use it to detect flag changes made by other
/// writers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModSeq(pub u64);

impl ModSeq {
    pub fn next(self) -> Self {
        ModSeq(self.0.saturating_add(1))
    }
}

impl fmt::Display for ModSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_next_stops_at_max() {
        assert_eq!(Uid::MIN.next(), Uid::of(2));
        assert_eq!(Uid::MAX.next(), None);
        assert_eq!(Uid::of(0), None);
    }

    #[test]
    fn seqnum_index_conversion() {
        assert_eq!(Seqnum::from_index(0), Seqnum::MIN);
        assert_eq!(Seqnum::of(5).map(Seqnum::to_index), Some(4));
    }

    #[test]
    fn uid_validity_always_grows() {
        let validity = UidValidity::initial();
        assert!(validity.next() > validity);

        let future = UidValidity::of(u32::MAX - 1).unwrap();
        assert_eq!(future.next().get(), u32::MAX);
    }
}
