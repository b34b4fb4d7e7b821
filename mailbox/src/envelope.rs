//! Module dedicated to message envelopes.
//!
//! The envelope is the summary of a message kept next to its record,
//! so that protocol responses do not need to hit the remote account.

use std::fmt;

use chrono::{DateTime, FixedOffset};

/// The address of a message participant.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct Address {
    pub name: Option<String>,
    pub addr: String,
}

impl Address {
    pub fn new(name: Option<impl ToString>, address: impl ToString) -> Self {
        Self {
            name: name.map(|name| name.to_string()),
            addr: address.to_string(),
        }
    }

    pub fn new_nameless(address: impl ToString) -> Self {
        Self {
            name: None,
            addr: address.to_string(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

/// The message envelope.
///
/// Composed of a few headers taken from the decrypted message.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub struct Envelope {
    /// The Message-ID header.
    pub message_id: String,
    /// The From header.
    pub from: Address,
    /// The To header.
    pub to: Address,
    /// The Subject header.
    pub subject: String,
    /// The Date header.
    pub date: DateTime<FixedOffset>,
}

impl Envelope {
    pub fn new(from: Address, to: Address, subject: impl ToString) -> Self {
        Self {
            from,
            to,
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    pub fn with_message_id(mut self, message_id: impl ToString) -> Self {
        self.message_id = message_id.to_string();
        self
    }

    pub fn with_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.date = date;
        self
    }
}
