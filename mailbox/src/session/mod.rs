//! # Session
//!
//! Module dedicated to IMAP sessions. A [`Session`] is the state
//! machine of one IMAP connection:
//!
//! ```text
//! Unauthenticated -> Authenticated <-> Selected(mailbox)
//!                          \               /
//!                           `--> Logout <-'
//! ```
//!
//! On selection, the session takes a [`Snapshot`] of the mailbox and
//! holds it until the next [`Session::poll`]: sequence numbers used
//! by commands always refer to this frozen view, whatever other
//! sessions or the sync engine do meanwhile. Pending expunges are
//! only flushed by polls, which the protocol layer runs between
//! commands.

pub mod search;

use std::{collections::BTreeSet, result, sync::Arc};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    account::{self, Account},
    envelope::Envelope,
    flag::{Flag, FlagMode, Flags},
    mailbox::{
        self, state::MailboxState, Mailbox, MailboxHandle, MessageRecord, SelectionGuard,
        Snapshot, SnapshotEntry,
    },
    sequence::{self, SequenceSet},
    uid::{ModSeq, Seqnum, Uid, UidValidity},
};

#[doc(inline)]
pub use self::search::{Largest, SearchKey};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot run command: session not authenticated")]
    NotAuthenticatedError,
    #[error("cannot authenticate: session already authenticated")]
    AlreadyAuthenticatedError,
    #[error("cannot run command: session logged out")]
    LoggedOutError,
    #[error("cannot run command: no mailbox selected")]
    NoMailboxSelectedError,
    #[error("cannot run command: mailbox {0} has been invalidated, select it again")]
    MailboxInvalidatedError(String),
    #[error("cannot select mailbox {0}: mailbox not exposed")]
    MailboxFilteredError(String),
    #[error("cannot modify mailbox {0}: mailbox opened in read-only mode")]
    ReadOnlyMailboxError(String),
    #[error("cannot parse message set")]
    ParseMessageSetError(#[source] sequence::Error),
    #[error(transparent)]
    MailboxError(#[from] mailbox::Error),
    #[error(transparent)]
    AccountError(account::Error),
}

impl From<account::Error> for Error {
    fn from(err: account::Error) -> Self {
        match err {
            account::Error::MailboxFilteredError(name) => Self::MailboxFilteredError(name),
            err => Self::AccountError(err),
        }
    }
}

/// The public state of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Selected,
    Logout,
}

/// The set of messages targeted by a command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MessageSet {
    /// Messages addressed by sequence number.
    Seqnums(SequenceSet),

    /// Messages addressed by UID.
    Uids(SequenceSet),
}

/// The response to a mailbox selection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelectResponse {
    /// `* OK [UIDVALIDITY uid_validity]`
    pub uid_validity: UidValidity,
    /// `* OK [UIDNEXT uid_next]`
    pub uid_next: Uid,
    /// `* exists EXISTS`
    pub exists: u32,
    /// `* recent RECENT`
    pub recent: u32,
    /// `* OK [UNSEEN unseen]`, if any message is unseen.
    pub unseen: Option<Seqnum>,
    /// `[READ-ONLY]` or `[READ-WRITE]`
    pub read_only: bool,
}

impl SelectResponse {
    fn new(state: MailboxState, read_only: bool) -> Self {
        Self {
            uid_validity: state.uid_validity,
            uid_next: state.uid_next,
            exists: state.exists,
            recent: state.recent,
            unseen: state.unseen,
            read_only,
        }
    }
}

/// The changes a session needs to report before its next command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PollResponse {
    /// `* seqnum EXPUNGE` responses, to be sent in this order.
    pub expunged: Vec<(Seqnum, Uid)>,

    /// `* exists EXISTS`, if messages were appended.
    pub exists: Option<u32>,

    /// `* recent RECENT`, if messages were appended.
    pub recent: Option<u32>,

    /// `* seqnum FETCH (FLAGS ...)` responses, for flags changed by
    /// other writers.
    pub fetch: Vec<MessageView>,

    /// The mailbox was invalidated: the session is back to the
    /// authenticated state and the client needs to select the mailbox
    /// again.
    pub invalidated: bool,
}

/// A message as seen by a session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageView {
    pub seqnum: Seqnum,
    pub uid: Uid,
    pub flags: Flags,
    pub size: u32,
    pub envelope: Arc<Envelope>,
}

impl MessageView {
    fn from_entry(seqnum: Seqnum, entry: &SnapshotEntry) -> Self {
        Self {
            seqnum,
            uid: entry.uid,
            flags: entry.flags.clone(),
            size: entry.size,
            envelope: entry.envelope.clone(),
        }
    }

    /// Builds the view of a snapshot entry using the live record, if
    /// it still exists. `\Recent` is session-relative and always
    /// taken from the snapshot.
    fn from_live(seqnum: Seqnum, entry: &SnapshotEntry, record: Option<&MessageRecord>) -> Self {
        let Some(record) = record else {
            return Self::from_entry(seqnum, entry);
        };

        let mut flags = record.flags.without_recent();
        if entry.flags.is_recent() {
            flags.insert(Flag::Recent);
        }

        Self {
            seqnum,
            uid: entry.uid,
            flags,
            size: record.size,
            envelope: record.envelope.clone(),
        }
    }
}

#[derive(Debug)]
struct Selection {
    mailbox: MailboxHandle,
    snapshot: Snapshot,
    read_only: bool,
    _guard: SelectionGuard,
}

impl Selection {
    fn name(&self) -> String {
        self.mailbox.name().to_owned()
    }

    /// Returns the values `*` stands for in the snapshot.
    fn largest(&self) -> Largest {
        Largest {
            seqnum: self.snapshot.max_seqnum().unwrap_or(Seqnum::MIN).into(),
            uid: self.snapshot.max_uid().unwrap_or(Uid::MIN).into(),
        }
    }

    /// Resolves the given set against the snapshot, in ascending
    /// sequence number order.
    fn targets(&self, set: &MessageSet) -> mailbox::Result<Vec<(Seqnum, &SnapshotEntry)>> {
        let largest = self.largest();

        match set {
            MessageSet::Seqnums(set) => {
                let max = sequence::max(set, largest.seqnum);
                if max as usize > self.snapshot.len() {
                    let seqnum = Seqnum::of(max).unwrap_or(Seqnum::MAX);
                    return Err(mailbox::Error::SeqnumNotFoundError(self.name(), seqnum));
                }

                Ok(self
                    .snapshot
                    .iter()
                    .filter(|(seqnum, _)| sequence::contains(set, seqnum.get(), largest.seqnum))
                    .collect())
            }
            MessageSet::Uids(set) => Ok(self
                .snapshot
                .iter()
                .filter(|(_, entry)| sequence::contains(set, entry.uid.get(), largest.uid))
                .collect()),
        }
    }

    fn recent(&self) -> u32 {
        let recent = self.snapshot.iter().filter(|(_, entry)| entry.flags.is_recent());
        u32::try_from(recent.count()).unwrap_or(u32::MAX)
    }
}

/// What changed in the live mailbox since a snapshot was taken.
struct LiveChanges {
    uid_validity: UidValidity,
    modseq: ModSeq,
    vanished: BTreeSet<Uid>,
    changed: Vec<(Uid, Flags, ModSeq)>,
    appended: Vec<SnapshotEntry>,
}

impl LiveChanges {
    fn collect(mailbox: &Mailbox, snapshot: &Snapshot, is_new: impl Fn(Uid) -> bool) -> Self {
        let mut vanished = BTreeSet::new();
        let mut changed = Vec::new();

        for (_, entry) in snapshot.iter() {
            match mailbox.get(entry.uid) {
                None => {
                    vanished.insert(entry.uid);
                }
                Some(record) if record.modseq > entry.modseq => {
                    changed.push((record.uid, record.flags.clone(), record.modseq));
                }
                Some(_) => (),
            }
        }

        let mut appended: Vec<SnapshotEntry> = mailbox
            .records()
            .iter()
            .rev()
            .take_while(|record| is_new(record.uid))
            .map(SnapshotEntry::from)
            .collect();
        appended.reverse();

        Self {
            uid_validity: mailbox.allocator().current_validity(),
            modseq: mailbox.modseq(),
            vanished,
            changed,
            appended,
        }
    }
}

#[derive(Debug)]
enum State {
    Unauthenticated,
    Authenticated,
    Selected(Selection),
    Logout,
}

/// The IMAP session.
///
/// Dropping a session releases its mailbox selection.
#[derive(Debug)]
pub struct Session {
    account: Arc<Account>,
    state: State,
}

impl Session {
    pub fn new(account: Arc<Account>) -> Self {
        Self {
            account,
            state: State::Unauthenticated,
        }
    }

    pub fn state(&self) -> SessionState {
        match self.state {
            State::Unauthenticated => SessionState::Unauthenticated,
            State::Authenticated => SessionState::Authenticated,
            State::Selected(_) => SessionState::Selected,
            State::Logout => SessionState::Logout,
        }
    }

    /// Returns the name of the selected mailbox, if any.
    pub fn selected(&self) -> Option<&str> {
        match &self.state {
            State::Selected(selection) => Some(selection.mailbox.name()),
            _ => None,
        }
    }

    /// Returns the frozen view of the selected mailbox, if any.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match &self.state {
            State::Selected(selection) => Some(&selection.snapshot),
            _ => None,
        }
    }

    fn ensure_authenticated(&self) -> Result<()> {
        match self.state {
            State::Unauthenticated => Err(Error::NotAuthenticatedError),
            State::Logout => Err(Error::LoggedOutError),
            _ => Ok(()),
        }
    }

    fn selection(&self) -> Result<&Selection> {
        match &self.state {
            State::Selected(selection) => Ok(selection),
            State::Authenticated => Err(Error::NoMailboxSelectedError),
            State::Unauthenticated => Err(Error::NotAuthenticatedError),
            State::Logout => Err(Error::LoggedOutError),
        }
    }

    fn selection_mut(&mut self) -> Result<&mut Selection> {
        match &mut self.state {
            State::Selected(selection) => Ok(selection),
            State::Authenticated => Err(Error::NoMailboxSelectedError),
            State::Unauthenticated => Err(Error::NotAuthenticatedError),
            State::Logout => Err(Error::LoggedOutError),
        }
    }

    /// Moves the session to the authenticated state.
    ///
    /// Credentials are checked by the credential collaborator before
    /// this call.
    pub fn authenticate(&mut self) -> Result<()> {
        match self.state {
            State::Unauthenticated => {
                debug!("session authenticated");
                self.state = State::Authenticated;
                Ok(())
            }
            State::Logout => Err(Error::LoggedOutError),
            _ => Err(Error::AlreadyAuthenticatedError),
        }
    }

    /// Selects the given mailbox in read-write mode.
    pub async fn select(&mut self, name: &str) -> Result<SelectResponse> {
        self.open(name, false).await
    }

    /// Selects the given mailbox in read-only mode: messages cannot be
    /// modified, and `\Recent` flags are left untouched.
    pub async fn examine(&mut self, name: &str) -> Result<SelectResponse> {
        self.open(name, true).await
    }

    #[instrument(skip(self))]
    async fn open(&mut self, name: &str, read_only: bool) -> Result<SelectResponse> {
        self.ensure_authenticated()?;

        // selecting closes the current selection, without expunge
        self.state = State::Authenticated;

        let mailbox = self.account.mailbox(name)?;
        let guard = mailbox.register_selection();

        let (state, snapshot) = mailbox
            .mutate(|mailbox| {
                let expunged = mailbox.flush_pending_expunges();
                if !expunged.is_empty() {
                    debug!("flushed {} pending expunges", expunged.len());
                }

                let state = mailbox.state();
                let snapshot = mailbox.snapshot();

                if !read_only {
                    mailbox.clear_recent(|_| true);
                }

                Ok((state, snapshot))
            })
            .await?;

        debug!(exists = state.exists, recent = state.recent, "mailbox selected");

        self.state = State::Selected(Selection {
            mailbox,
            snapshot,
            read_only,
            _guard: guard,
        });

        Ok(SelectResponse::new(state, read_only))
    }

    /// Returns the state of the given mailbox, without selecting it.
    pub async fn status(&self, name: &str) -> Result<MailboxState> {
        self.ensure_authenticated()?;
        Ok(self.account.mailbox(name)?.state().await)
    }

    /// Parses a message set from its IMAP format.
    ///
    /// `*` is resolved against the snapshot when the set is used: it
    /// stands for the greatest sequence number or UID of the
    /// snapshot.
    pub fn message_set(&self, raw: &str, by_uid: bool) -> Result<MessageSet> {
        self.selection()?;

        let set = sequence::parse(raw).map_err(Error::ParseMessageSetError)?;

        if by_uid {
            Ok(MessageSet::Uids(set))
        } else {
            Ok(MessageSet::Seqnums(set))
        }
    }

    /// Drops the selection if the mailbox was invalidated since the
    /// snapshot was taken.
    async fn check_validity(&mut self) -> Result<()> {
        let selection = self.selection()?;
        let uid_validity = selection.mailbox.state().await.uid_validity;

        if uid_validity == selection.snapshot.uid_validity() {
            return Ok(());
        }

        let name = selection.name();
        warn!(mailbox = %name, "mailbox invalidated, dropping selection");
        self.state = State::Authenticated;

        Err(Error::MailboxInvalidatedError(name))
    }

    /// Returns the targeted messages, in ascending sequence number
    /// order.
    pub async fn fetch(&mut self, set: &MessageSet) -> Result<Vec<MessageView>> {
        self.check_validity().await?;

        let selection = self.selection()?;
        let targets = selection.targets(set)?;
        let mailbox = selection.mailbox.read().await;

        let views = targets
            .into_iter()
            .map(|(seqnum, entry)| MessageView::from_live(seqnum, entry, mailbox.get(entry.uid)))
            .collect();

        Ok(views)
    }

    /// Applies the given flag delta to the targeted messages.
    ///
    /// Messages expunged by another writer are skipped. Fails if all
    /// targeted messages were expunged.
    pub async fn store(
        &mut self,
        set: &MessageSet,
        delta: &Flags,
        mode: FlagMode,
    ) -> Result<Vec<MessageView>> {
        self.check_validity().await?;

        let selection = self.selection()?;
        if selection.read_only {
            return Err(Error::ReadOnlyMailboxError(selection.name()));
        }

        let targets: Vec<(Seqnum, Uid)> = selection
            .targets(set)?
            .into_iter()
            .map(|(seqnum, entry)| (seqnum, entry.uid))
            .collect();

        let Some((_, first)) = targets.first().copied() else {
            return Ok(Vec::new());
        };

        let records = selection
            .mailbox
            .mutate(|mailbox| {
                let mut records = Vec::with_capacity(targets.len());

                for (seqnum, uid) in &targets {
                    match mailbox.set_flags(*uid, delta, mode) {
                        Ok(record) => records.push((*seqnum, record)),
                        Err(err) if err.is_not_found() => {
                            debug!(%uid, "skipping expunged message");
                        }
                        Err(err) => return Err(err),
                    }
                }

                if records.is_empty() {
                    return Err(mailbox::Error::UidNotFoundError(
                        mailbox.name().to_owned(),
                        first,
                    ));
                }

                Ok(records)
            })
            .await?;

        let views = records
            .into_iter()
            .filter_map(|(seqnum, record)| {
                let entry = selection.snapshot.get(seqnum)?;
                Some(MessageView::from_live(seqnum, entry, Some(&record)))
            })
            .collect();

        Ok(views)
    }

    /// Returns the messages of the snapshot matching the given key, in
    /// ascending sequence number order.
    pub async fn search(&mut self, key: &SearchKey) -> Result<Vec<MessageView>> {
        self.check_validity().await?;

        let selection = self.selection()?;
        let mailbox = selection.mailbox.read().await;

        let largest = selection.largest();

        let views = selection
            .snapshot
            .iter()
            .map(|(seqnum, entry)| MessageView::from_live(seqnum, entry, mailbox.get(entry.uid)))
            .filter(|view| key.matches(view, &largest))
            .collect();

        Ok(views)
    }

    /// Removes every message flagged `\Deleted` from the mailbox.
    ///
    /// Returns the `EXPUNGE` responses to send, in order.
    pub async fn expunge(&mut self) -> Result<Vec<(Seqnum, Uid)>> {
        self.check_validity().await?;

        let selection = self.selection_mut()?;
        if selection.read_only {
            return Err(Error::ReadOnlyMailboxError(selection.name()));
        }

        let removed = selection.mailbox.expunge().await?;
        let expunged = selection
            .snapshot
            .remove_vanished(|uid| removed.binary_search(&uid).is_err());

        debug!("expunged {} messages", expunged.len());
        Ok(expunged)
    }

    /// Reports what changed since the last poll, and updates the
    /// snapshot accordingly. Runs between commands.
    pub async fn poll(&mut self) -> Result<PollResponse> {
        let selection = match &mut self.state {
            State::Selected(selection) => selection,
            State::Authenticated => return Ok(PollResponse::default()),
            State::Unauthenticated => return Err(Error::NotAuthenticatedError),
            State::Logout => return Err(Error::LoggedOutError),
        };

        let read_only = selection.read_only;
        let max_uid = selection.snapshot.max_uid();
        let is_new = move |uid: Uid| max_uid.map_or(true, |max| uid > max);

        let needs_write = {
            let mailbox = selection.mailbox.read().await;
            let has_recent = || {
                mailbox
                    .records()
                    .iter()
                    .rev()
                    .take_while(|record| is_new(record.uid))
                    .any(|record| record.flags.is_recent())
            };
            !mailbox.pending_expunges().is_empty() || (!read_only && has_recent())
        };

        let changes = if needs_write {
            let snapshot = &selection.snapshot;
            selection
                .mailbox
                .mutate(|mailbox| {
                    mailbox.flush_pending_expunges();
                    let changes = LiveChanges::collect(mailbox, snapshot, is_new);
                    if !read_only {
                        mailbox.clear_recent(is_new);
                    }
                    Ok(changes)
                })
                .await?
        } else {
            let mailbox = selection.mailbox.read().await;
            LiveChanges::collect(&mailbox, &selection.snapshot, is_new)
        };

        if changes.uid_validity != selection.snapshot.uid_validity() {
            info!(mailbox = %selection.name(), "mailbox invalidated, dropping selection");
            self.state = State::Authenticated;
            return Ok(PollResponse {
                invalidated: true,
                ..Default::default()
            });
        }

        let snapshot = &mut selection.snapshot;
        let expunged = snapshot.remove_vanished(|uid| !changes.vanished.contains(&uid));

        let mut changed_uids = Vec::new();
        for (uid, flags, modseq) in changes.changed {
            if let Some(entry) = snapshot.get_mut(uid) {
                let mut flags = flags.without_recent();
                if entry.flags.is_recent() {
                    flags.insert(Flag::Recent);
                }

                entry.modseq = modseq;
                if entry.flags != flags {
                    entry.flags = flags;
                    changed_uids.push(uid);
                }
            }
        }

        let appended = changes.appended.len();
        for entry in changes.appended {
            snapshot.push(entry);
        }
        snapshot.set_modseq(changes.modseq);

        let fetch = changed_uids
            .into_iter()
            .filter_map(|uid| {
                let seqnum = snapshot.seqnum_of(uid)?;
                let entry = snapshot.get(seqnum)?;
                Some(MessageView::from_entry(seqnum, entry))
            })
            .collect();

        let (exists, recent) = if appended > 0 {
            let exists = u32::try_from(snapshot.len()).unwrap_or(u32::MAX);
            (Some(exists), Some(selection.recent()))
        } else {
            (None, None)
        };

        Ok(PollResponse {
            expunged,
            exists,
            recent,
            fetch,
            invalidated: false,
        })
    }

    /// Expunges the selected mailbox, unless opened in read-only mode,
    /// then closes it. No `EXPUNGE` response is sent.
    pub async fn close(&mut self) -> Result<()> {
        let selection = self.selection()?;

        if !selection.read_only {
            selection.mailbox.expunge().await?;
        }

        self.state = State::Authenticated;
        Ok(())
    }

    /// Closes the selected mailbox without expunging it.
    pub fn unselect(&mut self) -> Result<()> {
        self.selection()?;
        self.state = State::Authenticated;
        Ok(())
    }

    pub fn logout(&mut self) {
        debug!("session logged out");
        self.state = State::Logout;
    }
}

