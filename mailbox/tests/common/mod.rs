#![allow(dead_code)]

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailbox::{
    envelope::{Address, Envelope},
    flag::Flags,
    remote::{
        Decrypt, EventBatch, RemoteEvent, RemoteFeed, RemoteListing, RemoteMessage, RemotePayload,
    },
    AnyError, AnyResult,
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("remote account unreachable")]
pub struct UnreachableError;

impl AnyError for UnreachableError {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Error)]
#[error("invalid signature")]
pub struct DecryptError;

impl AnyError for DecryptError {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// In-memory remote feed serving queued batches.
///
/// Once the queue is empty, the feed serves empty batches keeping the
/// requested cursor.
#[derive(Debug, Default)]
pub struct MockFeed {
    batches: Mutex<VecDeque<EventBatch>>,
    listing: Mutex<RemoteListing>,
    failures: AtomicUsize,
    pub fetches: AtomicUsize,
    pub listings: AtomicUsize,
}

impl MockFeed {
    pub fn push(&self, batch: EventBatch) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn set_listing(&self, listing: RemoteListing) {
        *self.listing.lock().unwrap() = listing;
    }

    /// Makes the next `n` calls fail.
    pub fn fail(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteFeed for MockFeed {
    async fn fetch_events(&self, _mailbox: &str, cursor: Option<&str>) -> AnyResult<EventBatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if self.should_fail() {
            return Err(Box::new(UnreachableError));
        }

        let batch = self.batches.lock().unwrap().pop_front();
        Ok(batch.unwrap_or_else(|| EventBatch {
            cursor: cursor.map(ToOwned::to_owned),
            ..Default::default()
        }))
    }

    async fn full_list(&self, _mailbox: &str) -> AnyResult<RemoteListing> {
        self.listings.fetch_add(1, Ordering::SeqCst);

        if self.should_fail() {
            return Err(Box::new(UnreachableError));
        }

        Ok(self.listing.lock().unwrap().clone())
    }
}

/// Decrypts payloads holding a plain subject, fails on empty ones.
#[derive(Debug, Default)]
pub struct MockDecrypt;

#[async_trait]
impl Decrypt for MockDecrypt {
    async fn decrypt(&self, _remote_id: &str, payload: &[u8]) -> AnyResult<Envelope> {
        if payload.is_empty() {
            return Err(Box::new(DecryptError));
        }

        let subject = String::from_utf8_lossy(payload);
        Ok(envelope(&subject))
    }
}

pub fn envelope(subject: &str) -> Envelope {
    Envelope::new(
        Address::new(Some("Alice"), "alice@localhost"),
        Address::new_nameless("bob@localhost"),
        subject,
    )
}

pub fn message(id: &str, order: u64, flags: &str) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        order,
        flags: Flags::from(flags),
        size: 1024,
        payload: RemotePayload::Plain(envelope(id)),
    }
}

pub fn encrypted(id: &str, order: u64, payload: &[u8]) -> RemoteMessage {
    RemoteMessage {
        id: id.into(),
        order,
        flags: Flags::default(),
        size: 1024,
        payload: RemotePayload::Encrypted(payload.to_vec()),
    }
}

pub fn created(id: &str, order: u64, flags: &str) -> RemoteEvent {
    RemoteEvent::Created(message(id, order, flags))
}

pub fn updated(id: &str, flags: &str, at: DateTime<Utc>) -> RemoteEvent {
    RemoteEvent::Updated {
        id: id.into(),
        flags: Flags::from(flags),
        at,
    }
}

pub fn removed(id: &str) -> RemoteEvent {
    RemoteEvent::Removed(id.into())
}

pub fn batch(events: Vec<RemoteEvent>, cursor: &str) -> EventBatch {
    EventBatch {
        events,
        cursor: Some(cursor.into()),
        gap: false,
    }
}
