//! Module dedicated to session search.
//!
//! Only predicates over flags, sizes, UIDs and sequence numbers are
//! supported. Text predicates need message bodies, which this library
//! does not hold.

use std::num::NonZeroU32;

use crate::{
    flag::Flag,
    sequence::{self, SequenceSet},
};

use super::MessageView;

/// The values `*` stands for in the view searched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Largest {
    pub seqnum: NonZeroU32,
    pub uid: NonZeroU32,
}

/// The search key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SearchKey {
    /// Matches every message.
    All,

    /// Matches messages having the given flag.
    Flag(Flag),

    /// Matches messages whose UID is part of the given set.
    Uid(SequenceSet),

    /// Matches messages whose sequence number is part of the given
    /// set.
    Seq(SequenceSet),

    /// Matches messages bigger than the given size, in bytes.
    Larger(u32),

    /// Matches messages smaller than the given size, in bytes.
    Smaller(u32),

    /// Matches messages matching all the given keys.
    And(Vec<SearchKey>),

    /// Matches messages matching at least one of the given keys.
    Or(Box<SearchKey>, Box<SearchKey>),

    /// Matches messages not matching the given key.
    Not(Box<SearchKey>),
}

impl SearchKey {
    /// Matches messages without `\Seen`.
    pub fn unseen() -> Self {
        Self::not(Self::Flag(Flag::Seen))
    }

    pub fn not(key: SearchKey) -> Self {
        Self::Not(Box::new(key))
    }

    pub fn or(left: SearchKey, right: SearchKey) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }

    pub fn matches(&self, message: &MessageView, largest: &Largest) -> bool {
        match self {
            Self::All => true,
            Self::Flag(flag) => message.flags.contains(flag),
            Self::Uid(set) => sequence::contains(set, message.uid.get(), largest.uid),
            Self::Seq(set) => sequence::contains(set, message.seqnum.get(), largest.seqnum),
            Self::Larger(size) => message.size > *size,
            Self::Smaller(size) => message.size < *size,
            Self::And(keys) => keys.iter().all(|key| key.matches(message, largest)),
            Self::Or(left, right) => {
                left.matches(message, largest) || right.matches(message, largest)
            }
            Self::Not(key) => !key.matches(message, largest),
        }
    }
}
