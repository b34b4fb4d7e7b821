//! # Sequence set
//!
//! Module dedicated to IMAP sequence sets, used to address messages
//! either by sequence number or by UID. Parsing is left to
//! [`imap_types`]; this module resolves `*` and reversed ranges
//! against the view of a session, without expanding ranges: a `1:*`
//! over UIDs can span billions of numbers.

use std::{num::NonZeroU32, ops::RangeInclusive, result};

use thiserror::Error;

#[doc(inline)]
pub use imap_types::{
    error::ValidationError as SequenceSetError,
    sequence::{SeqOrUid, Sequence, SequenceSet},
};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("cannot parse sequence set {1}")]
    ParseSequenceSetError(#[source] SequenceSetError, String),
}

/// Parses the IMAP format of a sequence set.
pub fn parse(raw: &str) -> Result<SequenceSet> {
    SequenceSet::try_from(raw).map_err(|err| Error::ParseSequenceSetError(err, raw.to_owned()))
}

/// Returns the inclusive bounds of the given sequence, `*` standing
/// for `largest`.
///
/// `*:2` and `2:*` designate the same range.
pub fn bounds(sequence: &Sequence, largest: NonZeroU32) -> RangeInclusive<u32> {
    match sequence {
        Sequence::Single(n) => {
            let n = n.expand(largest).get();
            n..=n
        }
        Sequence::Range(start, end) => {
            let (start, end) = (start.expand(largest).get(), end.expand(largest).get());
            start.min(end)..=start.max(end)
        }
    }
}

/// Returns whether the given number is part of the set.
pub fn contains(set: &SequenceSet, n: u32, largest: NonZeroU32) -> bool {
    set.0
        .as_ref()
        .iter()
        .any(|sequence| bounds(sequence, largest).contains(&n))
}

/// Returns the greatest number of the set.
pub fn max(set: &SequenceSet, largest: NonZeroU32) -> u32 {
    set.0
        .as_ref()
        .iter()
        .map(|sequence| *bounds(sequence, largest).end())
        .max()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    fn largest(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn resolve_splat() {
        let set = super::parse("1:3,7,5:4,*").unwrap();

        assert!(super::contains(&set, 4, largest(10)));
        assert!(!super::contains(&set, 6, largest(10)));
        assert!(super::contains(&set, 10, largest(10)));
        assert_eq!(super::max(&set, largest(10)), 10);
        assert_eq!(super::max(&set, largest(2)), 7);

        let set = super::parse("*:3").unwrap();
        assert!(super::contains(&set, 2, largest(2)));
        assert!(super::contains(&set, 3, largest(2)));
        assert!(!super::contains(&set, 1, largest(2)));
    }

    #[test]
    fn large_ranges_are_not_expanded() {
        let set = super::parse("1:*").unwrap();
        assert!(super::contains(&set, u32::MAX, largest(u32::MAX)));
        assert_eq!(super::max(&set, largest(u32::MAX)), u32::MAX);
    }

    #[test]
    fn parse_errors() {
        for raw in ["", "0", "01", "1:2:3", "a", "1,"] {
            let err = super::parse(raw).unwrap_err();
            assert!(err.to_string().ends_with(raw), "{raw}");
        }
    }
}
