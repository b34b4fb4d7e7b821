//! Module dedicated to message flags.
//!
//! This module contains everything to parse, display and mutate
//! message flags, as well as the [`merge`] rule used to fold remote
//! flags into local ones.

pub mod merge;

use std::{
    collections::BTreeSet,
    fmt,
    ops::{Deref, DerefMut},
};

use tracing::debug;

/// The keyword attached to messages the decryption collaborator
/// could not decode.
pub const UNDECRYPTABLE: &str = "$Undecryptable";

/// The message flag.
///
/// System flags follow the IMAP definition. Any other flag is
/// considered as a keyword.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub enum Flag {
    /// Flag used when the message has been read.
    Seen,

    /// Flag used when the message has been answered.
    Answered,

    /// Flag used as a bookmark. The meaning is specific to the user:
    /// it could be important, starred, to check etc.
    Flagged,

    /// Flag used when the message is marked for expunge.
    Deleted,

    /// Flag used when the message is a draft and is therefore not
    /// complete.
    Draft,

    /// Flag used when the message arrived since the mailbox was last
    /// selected. Managed by the server, never by clients.
    Recent,

    /// Flag used for all other use cases.
    Keyword(String),
}

impl Flag {
    /// Creates a keyword flag.
    pub fn keyword(flag: impl ToString) -> Self {
        Self::Keyword(flag.to_string())
    }

    pub fn is_keyword(&self) -> bool {
        matches!(self, Self::Keyword(_))
    }

    /// Parses a flag in strict IMAP syntax: only backslash-prefixed
    /// atoms are system flags, anything else is a keyword kept as is.
    ///
    /// Returns `None` for unknown system flags.
    pub fn parse_imap(s: &str) -> Option<Self> {
        let Some(name) = s.strip_prefix('\\') else {
            return Some(Flag::Keyword(s.to_owned()));
        };

        match name {
            seen if seen.eq_ignore_ascii_case("seen") => Some(Flag::Seen),
            answered if answered.eq_ignore_ascii_case("answered") => Some(Flag::Answered),
            flagged if flagged.eq_ignore_ascii_case("flagged") => Some(Flag::Flagged),
            deleted if deleted.eq_ignore_ascii_case("deleted") => Some(Flag::Deleted),
            draft if draft.eq_ignore_ascii_case("draft") => Some(Flag::Draft),
            recent if recent.eq_ignore_ascii_case("recent") => Some(Flag::Recent),
            _ => None,
        }
    }
}

/// Parse a flag from a string. The leading backslash of system flags
/// is optional. If the string does not match any system flag, it is
/// considered as a keyword.
impl From<&str> for Flag {
    fn from(s: &str) -> Self {
        let s = s.trim();
        match s.strip_prefix('\\').unwrap_or(s) {
            seen if seen.eq_ignore_ascii_case("seen") => Flag::Seen,
            answered if answered.eq_ignore_ascii_case("answered") => Flag::Answered,
            flagged if flagged.eq_ignore_ascii_case("flagged") => Flag::Flagged,
            deleted if deleted.eq_ignore_ascii_case("deleted") => Flag::Deleted,
            draft if draft.eq_ignore_ascii_case("draft") => Flag::Draft,
            recent if recent.eq_ignore_ascii_case("recent") => Flag::Recent,
            _ => Flag::Keyword(s.to_owned()),
        }
    }
}

impl From<String> for Flag {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Recent => write!(f, "\\Recent"),
            Flag::Keyword(flag) => write!(f, "{flag}"),
        }
    }
}

/// The way a flag delta is applied to a set of flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlagMode {
    /// Adds the delta to the current flags (`+FLAGS`).
    Add,

    /// Removes the delta from the current flags (`-FLAGS`).
    Remove,

    /// Replaces the current flags with the delta (`FLAGS`).
    Replace,
}

/// The set of message flags.
///
/// Uses a [`BTreeSet`] to prevent duplicates and to keep a stable
/// display order.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Flags(BTreeSet<Flag>);

impl Flags {
    /// Applies the given delta according to the given mode.
    ///
    /// Returns `true` if the flags changed.
    pub fn apply(&mut self, delta: &Flags, mode: FlagMode) -> bool {
        let prev = self.0.clone();

        match mode {
            FlagMode::Add => self.0.extend(delta.iter().cloned()),
            FlagMode::Remove => self.0.retain(|flag| !delta.contains(flag)),
            FlagMode::Replace => {
                // \Recent is owned by the server and survives replacement
                let recent = self.0.contains(&Flag::Recent);
                self.0 = delta.0.clone();
                if recent {
                    self.0.insert(Flag::Recent);
                }
            }
        }

        prev != self.0
    }

    /// Returns the flags that differ between the two sets.
    pub fn symmetric_difference_with(&self, other: &Flags) -> BTreeSet<Flag> {
        self.0.symmetric_difference(&other.0).cloned().collect()
    }

    /// Returns a copy of the flags without [`Flag::Recent`].
    pub fn without_recent(&self) -> Flags {
        self.iter()
            .filter(|flag| **flag != Flag::Recent)
            .cloned()
            .collect()
    }

    pub fn is_seen(&self) -> bool {
        self.contains(&Flag::Seen)
    }

    pub fn is_deleted(&self) -> bool {
        self.contains(&Flag::Deleted)
    }

    pub fn is_recent(&self) -> bool {
        self.contains(&Flag::Recent)
    }

    /// Parses space-separated flags in strict IMAP syntax, the
    /// inverse of the `Display` implementation.
    ///
    /// See [`Flag::parse_imap`].
    pub fn parse_imap(s: &str) -> Self {
        s.split_whitespace()
            .filter_map(|flag| {
                let parsed = Flag::parse_imap(flag);
                if parsed.is_none() {
                    debug!("unknown system flag {flag}, skipping it");
                }
                parsed
            })
            .collect()
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, flag) in self.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{flag}")?;
        }
        Ok(())
    }
}

impl Deref for Flags {
    type Target = BTreeSet<Flag>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Flags {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<&str> for Flags {
    fn from(s: &str) -> Self {
        s.split_whitespace()
            .filter_map(|flag| {
                let flag = Flag::from(flag);
                match &flag {
                    Flag::Keyword(keyword) if keyword.starts_with('\\') => {
                        debug!("unknown system flag {keyword}, skipping it");
                        None
                    }
                    _ => Some(flag),
                }
            })
            .collect()
    }
}

impl From<String> for Flags {
    fn from(s: String) -> Self {
        s.as_str().into()
    }
}

impl FromIterator<Flag> for Flags {
    fn from_iter<T: IntoIterator<Item = Flag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Flags> for Vec<String> {
    fn from(val: Flags) -> Self {
        val.iter().map(|flag| flag.to_string()).collect()
    }
}
