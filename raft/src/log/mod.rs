//! Types related to Raft log storage.
//!
//! Raft requires a backing storage for the entries of its replicated log. The [`Log`] trait is implemented for that
//! purpose and the implementation is supplied to [`Node`](crate::node::Node). [`LogState`] wraps a [`Log`] together
//! with the commit index and enforces the log-matching rules used during replication.

use std::fmt;
use std::iter;

use ::log::{error, info};

use crate::message::{LogEntry, LogIndex, TermId};

pub mod memory;

/// An interface for storage of the Raft log of a [`Node`](crate::node::Node).
///
/// A log is initialized as empty, with [`last_index`] returning [`LogIndex::default()`]. The index of the first
/// appended entry is `1` and all indices are contiguous. Entries can only be removed from the end of the log, via
/// [`cancel_from`].
///
/// [`cancel_from`]: Self::cancel_from
/// [`last_index`]: Self::last_index
pub trait Log {
    /// The type of error returned by fallible operations.
    type Error;

    /// Appends an entry to the end of the log.
    fn append(&mut self, entry: LogEntry) -> Result<(), Self::Error>;

    /// Cancels all entries including and after the entry at index `from_index`, removing them from the log. Returns the
    /// number of entries removed.
    ///
    /// # Errors
    ///
    /// If there was any error modifying the log, or if the entries did not exist, an error is returned.
    fn cancel_from(&mut self, from_index: LogIndex) -> Result<usize, Self::Error>;

    /// Returns the approximate serialized length in bytes of a given log entry.
    fn entry_len(&self, entry: &LogEntry) -> usize;

    /// Returns the entry at a given index, or `None` if the index is greater than the length of the log.
    fn get(&mut self, index: LogIndex) -> Option<LogEntry>;

    /// Returns the term of the entry at a given index, or `None` if the index is greater than the length of the log.
    fn get_term(&mut self, index: LogIndex) -> Option<TermId>;

    /// Returns the approximate serialized length of the entry at a given index.
    fn get_len(&mut self, index: LogIndex) -> Option<usize> {
        self.get(index).map(|entry: LogEntry| self.entry_len(&entry))
    }

    /// Returns the index of the last entry returned by [`take_next`](Self::take_next).
    fn last_taken_index(&self) -> LogIndex;

    /// Returns the index of the last entry in the log, or [`LogIndex::default()`] if empty.
    fn last_index(&self) -> LogIndex;

    /// Returns the term of the last entry in the log, or [`TermId::default()`] if empty.
    fn last_term(&self) -> TermId;

    /// Returns the next entry in the log not previously returned by this function.
    fn take_next(&mut self) -> Option<LogEntry>;
}

/// Returned by [`LogState::append_after`] when the entry preceding an append does not match the leader's log.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogConflict {
    /// The index the leader expected to match.
    pub prev_log_idx: LogIndex,

    /// Our term at that index, or `None` if our log is shorter.
    pub our_term: Option<TermId>,
}

pub(crate) struct LogState<L> {
    log: L,
    pub commit_idx: LogIndex,
}

/// An iterator yielding committed [log entries][`LogEntry`].
///
/// A given [`LogEntry`] will be yielded only once over the lifetime of a Raft node.
pub struct CommittedIter<'a, L> {
    log: &'a mut LogState<L>,
}

impl<L: Log> LogState<L> {
    pub fn new(log: L) -> Self {
        Self {
            log,
            commit_idx: LogIndex::default(),
        }
    }

    pub fn append(&mut self, entry: LogEntry) -> Result<(), L::Error> {
        self.log.append(entry)
    }

    /// Appends `entries` following the entry at `prev_log_idx`, overwriting any conflicting uncommitted suffix.
    ///
    /// Returns the index of the last entry known to match the leader's log.
    pub fn append_after(
        &mut self,
        prev_log_idx: LogIndex,
        prev_log_term: TermId,
        entries: Vec<LogEntry>,
    ) -> Result<LogIndex, LogConflict> {
        let our_term = self.get_term(prev_log_idx);
        if our_term != Some(prev_log_term) {
            return Err(LogConflict {
                prev_log_idx,
                our_term,
            });
        }

        let mut last_matched = prev_log_idx;
        for (entry_idx, entry) in (1..).map(|offset| prev_log_idx + offset).zip(entries) {
            if entry_idx == self.last_index() + 1 {
                if self.append(entry).is_err() {
                    break;
                }
            } else if let Some(existing_term) = self.get_term(entry_idx) {
                if existing_term != entry.term {
                    match self.cancel_from(entry_idx) {
                        Ok(cancelled) => info!("cancelled {} entries from {}", cancelled, &entry_idx),
                        Err(_) => break,
                    }
                    if self.append(entry).is_err() {
                        break;
                    }
                }
            } else {
                error!("failed to read log index {} while appending", &entry_idx);
                break;
            }
            last_matched = entry_idx;
        }
        Ok(last_matched)
    }

    /// Removes every entry from `from_index` onwards.
    ///
    /// # Panics
    ///
    /// Committed entries never change: cancelling at or below the commit index panics.
    pub fn cancel_from(&mut self, from_index: LogIndex) -> Result<usize, L::Error> {
        if from_index <= self.commit_idx {
            panic!(
                "refusing to cancel log from {} with entries committed up to {}",
                &from_index, &self.commit_idx
            );
        }
        self.log.cancel_from(from_index)
    }

    pub fn entry_len(&self, entry: &LogEntry) -> usize {
        self.log.entry_len(entry)
    }

    pub fn get(&mut self, index: LogIndex) -> Option<LogEntry> {
        if index == LogIndex::default() {
            None
        } else {
            self.log.get(index)
        }
    }

    pub fn get_term(&mut self, index: LogIndex) -> Option<TermId> {
        if index == LogIndex::default() {
            Some(TermId::default())
        } else {
            self.log.get_term(index)
        }
    }

    pub fn get_len(&mut self, index: LogIndex) -> Option<usize> {
        self.log.get_len(index)
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_term(&self) -> TermId {
        self.log.last_term()
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn take_committed(&mut self) -> CommittedIter<'_, L> {
        CommittedIter { log: self }
    }
}

impl fmt::Display for LogConflict {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.our_term {
            Some(term) => write!(fmt, "conflict at {}, we have {}", self.prev_log_idx, term),
            None => write!(fmt, "missing {}", self.prev_log_idx),
        }
    }
}

impl<L: Log> Iterator for CommittedIter<'_, L> {
    type Item = LogEntry;
    fn next(&mut self) -> Option<Self::Item> {
        if self.log.log.last_taken_index() < self.log.commit_idx {
            self.log.log.take_next()
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.log.commit_idx.id - self.log.log.last_taken_index().id) as usize;
        (remaining, Some(remaining))
    }
}

impl<L: Log> ExactSizeIterator for CommittedIter<'_, L> {}

impl<L: Log> iter::FusedIterator for CommittedIter<'_, L> {}
