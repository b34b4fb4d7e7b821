//! # Mailbox cache
//!
//! Module dedicated to mailbox persistence. The [`MailboxCache`]
//! stores, per mailbox, the UID validity, the UID next, the remote
//! feed cursor and every message record in a SQLite database, so that
//! known remote messages keep their UID across restarts.
//!
//! Flags are stored in their IMAP syntax and read back strictly, so
//! that a keyword never turns into a system flag. Records waiting for
//! their expunge to be reported carry a dedicated marker.

use std::{
    collections::BTreeSet,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    result,
    sync::{Arc, Mutex},
};

use advisory_lock::{AdvisoryFileLock, FileLockError, FileLockMode};
use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    envelope::{Address, Envelope},
    flag::Flags,
    mailbox::{Dirty, Mailbox, MessageRecord, RecordStore, UidAllocator},
    uid::{ModSeq, Uid, UidValidity},
};

const DB_FILE_NAME: &str = "mailboxes.sqlite";
const LOCK_FILE_NAME: &str = "mailboxes.lock";

const CREATE_MAILBOXES_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS mailboxes (
        name         TEXT PRIMARY KEY,
        uid_validity INTEGER NOT NULL,
        uid_next     INTEGER NOT NULL,
        modseq       INTEGER NOT NULL,
        cursor       TEXT
    )
";

const CREATE_RECORDS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS records (
        mailbox        TEXT NOT NULL,
        uid            INTEGER NOT NULL,
        remote_id      TEXT NOT NULL,
        flags          TEXT NOT NULL,
        size           INTEGER NOT NULL,
        sender_name    TEXT,
        sender         TEXT NOT NULL,
        recipient_name TEXT,
        recipient      TEXT NOT NULL,
        subject        TEXT NOT NULL,
        message_id     TEXT NOT NULL,
        date           TEXT NOT NULL,
        modseq         INTEGER NOT NULL,
        remote_order   INTEGER NOT NULL,
        decode_error   TEXT,
        pending        INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (mailbox, uid),
        UNIQUE (mailbox, remote_id)
    )
";

const SELECT_MAILBOX: &str = "
    SELECT uid_validity, uid_next, modseq, cursor
    FROM mailboxes
    WHERE name = ?
";

const SELECT_MAILBOX_NAMES: &str = "SELECT name FROM mailboxes ORDER BY name";

const SELECT_RECORDS: &str = "
    SELECT uid, remote_id, flags, size, sender_name, sender, recipient_name, recipient,
           subject, message_id, date, modseq, remote_order, decode_error, pending
    FROM records
    WHERE mailbox = ?
";

const UPSERT_MAILBOX: &str = "
    INSERT INTO mailboxes (name, uid_validity, uid_next, modseq, cursor)
    VALUES (?, ?, ?, ?, ?)
    ON CONFLICT (name) DO UPDATE SET
        uid_validity = excluded.uid_validity,
        uid_next = excluded.uid_next,
        modseq = excluded.modseq,
        cursor = excluded.cursor
";

const DELETE_RECORDS: &str = "DELETE FROM records WHERE mailbox = ?";

const DELETE_RECORD: &str = "DELETE FROM records WHERE mailbox = ? AND uid = ?";

const UPSERT_RECORD: &str = "
    INSERT OR REPLACE INTO records (
        mailbox, uid, remote_id, flags, size, sender_name, sender, recipient_name, recipient,
        subject, message_id, date, modseq, remote_order, decode_error, pending
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
";

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot create cache directory at {1}")]
    CreateCacheDirError(#[source] io::Error, PathBuf),
    #[error("cannot open cache lock file at {1}")]
    OpenLockFileError(#[source] io::Error, PathBuf),
    #[error("cannot lock cache at {1}: is another bridge running?")]
    LockFileError(#[source] FileLockError, PathBuf),
    #[error("cannot open cache database at {1}")]
    OpenDbError(#[source] rusqlite::Error, PathBuf),
    #[error("cannot open in-memory cache database")]
    OpenInMemoryDbError(#[source] rusqlite::Error),
    #[error("cannot create cache database tables")]
    CreateTablesError(#[source] rusqlite::Error),
    #[error("cannot acquire cache database connection")]
    AcquireConnectionError,
    #[error("cannot list cached mailboxes")]
    ListMailboxesError(#[source] rusqlite::Error),
    #[error("cannot load mailbox {1} from cache")]
    LoadMailboxError(#[source] rusqlite::Error, String),
    #[error("cannot load mailbox {0} from cache: invalid {1}")]
    InvalidValueError(String, &'static str),
    #[error("cannot save mailbox {1} to cache")]
    SaveMailboxError(#[source] rusqlite::Error, String),
}

/// The SQLite mailbox cache.
#[derive(Debug)]
pub struct MailboxCache {
    conn: Mutex<Connection>,

    /// Holds the advisory lock of the cache directory, released on
    /// drop.
    lock_file: Option<File>,
}

impl MailboxCache {
    /// Opens the cache database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("opening mailbox cache at {path:?}");

        let conn = Connection::open(path).map_err(|err| Error::OpenDbError(err, path.into()))?;
        Self::init(conn, None)
    }

    /// Opens a cache database living in memory.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::OpenInMemoryDbError)?;
        Self::init(conn, None)
    }

    /// Opens the cache database of the given directory, after taking
    /// an exclusive advisory lock on it.
    ///
    /// Fails if another process already holds the lock.
    pub fn open_locked(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|err| Error::CreateCacheDirError(err, dir.into()))?;

        let lock_file_path = dir.join(LOCK_FILE_NAME);
        debug!("locking cache file {lock_file_path:?}");

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_file_path)
            .map_err(|err| Error::OpenLockFileError(err, lock_file_path.clone()))?;
        AdvisoryFileLock::try_lock(&lock_file, FileLockMode::Exclusive)
            .map_err(|err| Error::LockFileError(err, lock_file_path))?;

        let path = dir.join(DB_FILE_NAME);
        let conn = Connection::open(&path).map_err(|err| Error::OpenDbError(err, path))?;
        Self::init(conn, Some(lock_file))
    }

    fn init(conn: Connection, lock_file: Option<File>) -> Result<Self> {
        trace!("create tables queries: {CREATE_MAILBOXES_TABLE:#?} {CREATE_RECORDS_TABLE:#?}");

        conn.execute(CREATE_MAILBOXES_TABLE, [])
            .map_err(Error::CreateTablesError)?;
        conn.execute(CREATE_RECORDS_TABLE, [])
            .map_err(Error::CreateTablesError)?;

        Ok(Self {
            conn: Mutex::new(conn),
            lock_file,
        })
    }

    /// Returns `true` if the cache holds the advisory lock of its
    /// directory.
    pub fn is_locked(&self) -> bool {
        self.lock_file.is_some()
    }

    /// Lists the names of the cached mailboxes.
    pub fn list(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().map_err(|_| Error::AcquireConnectionError)?;

        let mut stmt = conn
            .prepare(SELECT_MAILBOX_NAMES)
            .map_err(Error::ListMailboxesError)?;
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .map_err(Error::ListMailboxesError)?
            .collect::<rusqlite::Result<_>>()
            .map_err(Error::ListMailboxesError)?;

        Ok(names)
    }

    /// Loads the mailbox with the given name, if it was cached.
    pub fn load(&self, name: &str) -> Result<Option<Mailbox>> {
        debug!(mailbox = name, "loading mailbox from cache");

        let conn = self.conn.lock().map_err(|_| Error::AcquireConnectionError)?;
        let load_err = |err| Error::LoadMailboxError(err, name.to_owned());
        let invalid = |what| Error::InvalidValueError(name.to_owned(), what);

        let row: Option<(u32, u32, i64, Option<String>)> = conn
            .query_row(SELECT_MAILBOX, [name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .optional()
            .map_err(load_err)?;

        let Some((uid_validity, uid_next, modseq, cursor)) = row else {
            debug!(mailbox = name, "mailbox not found in cache");
            return Ok(None);
        };

        let uid_validity = UidValidity::of(uid_validity).ok_or_else(|| invalid("uid validity"))?;
        // zero means the uid space is exhausted
        let allocator = UidAllocator::restore(uid_validity, Uid::of(uid_next));

        let mut stmt = conn.prepare(SELECT_RECORDS).map_err(load_err)?;
        let rows = stmt
            .query_map([name], |row| {
                Ok(CachedRecord {
                    uid: row.get(0)?,
                    remote_id: row.get(1)?,
                    flags: row.get(2)?,
                    size: row.get(3)?,
                    sender_name: row.get(4)?,
                    sender: row.get(5)?,
                    recipient_name: row.get(6)?,
                    recipient: row.get(7)?,
                    subject: row.get(8)?,
                    message_id: row.get(9)?,
                    date: row.get(10)?,
                    modseq: row.get(11)?,
                    remote_order: row.get(12)?,
                    decode_error: row.get(13)?,
                    pending: row.get(14)?,
                })
            })
            .map_err(load_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(load_err)?;

        let mut pending_expunges = BTreeSet::new();
        let mut records = Vec::with_capacity(rows.len());

        for row in rows {
            let pending = row.pending;
            let record = row.into_record().ok_or_else(|| invalid("record uid"))?;
            if pending {
                pending_expunges.insert(record.uid);
            }
            records.push(record);
        }

        debug!(
            mailbox = name,
            records = records.len(),
            pending = pending_expunges.len(),
            "loaded mailbox from cache"
        );

        Ok(Some(Mailbox::restore(
            name,
            allocator,
            RecordStore::from_records(records),
            ModSeq(u64::try_from(modseq).unwrap_or_default()),
            cursor,
            pending_expunges,
        )))
    }

    /// Persists the given changes of the mailbox in one transaction.
    pub fn save(&self, mailbox: &Mailbox, dirty: &Dirty) -> Result<()> {
        let name = mailbox.name();
        debug!(mailbox = name, ?dirty, "saving mailbox to cache");

        let mut conn = self.conn.lock().map_err(|_| Error::AcquireConnectionError)?;
        let save_err = |err| Error::SaveMailboxError(err, name.to_owned());

        let tx = conn.transaction().map_err(save_err)?;

        let allocator = mailbox.allocator();
        tx.execute(
            UPSERT_MAILBOX,
            params![
                name,
                allocator.current_validity().get(),
                allocator.raw_uid_next().map(Uid::get).unwrap_or_default(),
                i64::try_from(mailbox.modseq().0).unwrap_or(i64::MAX),
                mailbox.cursor(),
            ],
        )
        .map_err(save_err)?;

        if dirty.reset {
            tx.execute(DELETE_RECORDS, [name]).map_err(save_err)?;
        }

        for uid in &dirty.removed {
            tx.execute(DELETE_RECORD, params![name, uid.get()])
                .map_err(save_err)?;
        }

        for record in dirty.upserted.iter().filter_map(|uid| mailbox.get(*uid)) {
            let envelope = &record.envelope;
            tx.execute(
                UPSERT_RECORD,
                params![
                    name,
                    record.uid.get(),
                    record.remote_id,
                    record.flags.to_string(),
                    record.size,
                    envelope.from.name,
                    envelope.from.addr,
                    envelope.to.name,
                    envelope.to.addr,
                    envelope.subject,
                    envelope.message_id,
                    envelope.date.to_rfc3339(),
                    i64::try_from(record.modseq.0).unwrap_or(i64::MAX),
                    i64::try_from(record.remote_order).unwrap_or(i64::MAX),
                    record.decode_error,
                    mailbox.pending_expunges().contains(&record.uid),
                ],
            )
            .map_err(save_err)?;
        }

        tx.commit().map_err(save_err)?;
        trace!(mailbox = name, "saved mailbox to cache");

        Ok(())
    }
}

struct CachedRecord {
    uid: u32,
    remote_id: String,
    flags: String,
    size: u32,
    sender_name: Option<String>,
    sender: String,
    recipient_name: Option<String>,
    recipient: String,
    subject: String,
    message_id: String,
    date: String,
    modseq: i64,
    remote_order: i64,
    decode_error: Option<String>,
    pending: bool,
}

impl CachedRecord {
    fn into_record(self) -> Option<MessageRecord> {
        let uid = Uid::of(self.uid)?;

        let mut envelope = Envelope::new(
            Address::new(self.sender_name, self.sender),
            Address::new(self.recipient_name, self.recipient),
            self.subject,
        )
        .with_message_id(self.message_id);

        match DateTime::parse_from_rfc3339(&self.date) {
            Ok(date) => envelope = envelope.with_date(date),
            Err(err) => debug!(%uid, "cannot parse cached date {}: {err}", self.date),
        }

        Some(MessageRecord {
            remote_id: self.remote_id,
            uid,
            flags: Flags::parse_imap(&self.flags),
            size: self.size,
            envelope: Arc::new(envelope),
            remote_order: u64::try_from(self.remote_order).unwrap_or_default(),
            modseq: ModSeq(u64::try_from(self.modseq).unwrap_or_default()),
            decode_error: self.decode_error,
            local_changes: Default::default(),
        })
    }
}
