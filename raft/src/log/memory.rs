//! An in-memory implementation of [`Log`](super::Log).

use std::convert::{TryFrom, TryInto};

use crate::message::{LogEntry, LogIndex, TermId};

use super::Log;

/// An unbounded in-memory [`Log`](super::Log). Entries are kept for the lifetime of the node.
#[derive(Default)]
pub struct InMemoryLog {
    entries: Vec<LogEntry>,
    last_taken: LogIndex,
}

impl InMemoryLog {
    /// Constructs an empty Raft log.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_index(&self, log_idx: LogIndex) -> Option<usize> {
        log_idx.id.checked_sub(1)?.try_into().ok()
    }
}

impl Log for InMemoryLog {
    type Error = ();

    fn append(&mut self, log_entry: LogEntry) -> Result<(), Self::Error> {
        self.entries.push(log_entry);
        Ok(())
    }

    fn cancel_from(&mut self, from_log_idx: LogIndex) -> Result<usize, ()> {
        let from_index = self.entry_index(from_log_idx).ok_or(())?;
        if from_log_idx <= self.last_taken {
            return Err(());
        }
        match self.entries.len().checked_sub(from_index) {
            Some(0) | None => Err(()),
            Some(cancelled_len) => {
                self.entries.truncate(from_index);
                Ok(cancelled_len)
            }
        }
    }

    fn entry_len(&self, log_entry: &LogEntry) -> usize {
        4 + log_entry.data.len()
    }

    fn get(&mut self, log_idx: LogIndex) -> Option<LogEntry> {
        let index = self.entry_index(log_idx)?;
        self.entries.get(index).cloned()
    }

    fn get_term(&mut self, log_idx: LogIndex) -> Option<TermId> {
        let index = self.entry_index(log_idx)?;
        self.entries.get(index).map(|log_entry| log_entry.term)
    }

    fn last_index(&self) -> LogIndex {
        let entries_len =
            u64::try_from(self.entries.len()).unwrap_or_else(|_| panic!("more than 2^64 log entries"));
        LogIndex { id: entries_len }
    }

    fn last_taken_index(&self) -> LogIndex {
        self.last_taken
    }

    fn last_term(&self) -> TermId {
        self.entries
            .last()
            .map(|log_entry| log_entry.term)
            .unwrap_or_default()
    }

    fn take_next(&mut self) -> Option<LogEntry> {
        let log_idx = self.last_taken + 1;
        let log_entry = self.get(log_idx)?;
        self.last_taken = log_idx;
        Some(log_entry)
    }
}
