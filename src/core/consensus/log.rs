// src/core/consensus/log.rs

//! The replicated log: a dense, 1-indexed sequence of term-stamped entries.

use serde::{Deserialize, Serialize};

/// One replicated operation.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: Vec<u8>,
    pub committed: bool,
}

/// The in-memory log. Index 1 is the first entry.
#[derive(Debug, Default, Clone)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Appends a new entry at `last_index() + 1` and returns its index.
    pub fn append(&mut self, term: u64, payload: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            payload,
            committed: false,
        });
        index
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get_mut((index - 1) as usize)
    }

    /// The term stored at `index`; index 0 is the implicit empty prefix with
    /// term 0.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// True when the log contains `prev_term` at `prev_index` (the
    /// log-matching precondition for accepting appended entries).
    pub fn matches(&self, prev_index: u64, prev_term: u64) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Drops every entry at `from` and beyond. Committed entries are never
    /// truncated; callers uphold that by only truncating conflicting
    /// uncommitted tails.
    pub fn truncate_from(&mut self, from: u64) {
        debug_assert!(
            self.get(from).is_none_or(|e| !e.committed),
            "attempted to truncate a committed entry"
        );
        self.entries.truncate(from.saturating_sub(1) as usize);
    }

    /// Appends replicated entries after `prev_index`, truncating any
    /// conflicting suffix first.
    pub fn splice(&mut self, prev_index: u64, entries: Vec<LogEntry>) {
        debug_assert!(prev_index <= self.last_index());
        for entry in entries {
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push(entry);
                }
                None => {
                    debug_assert_eq!(entry.index, self.last_index() + 1);
                    self.entries.push(entry);
                }
            }
        }
    }

    /// Entries from `from` (inclusive), at most `max` of them.
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    pub fn mark_committed(&mut self, up_to: u64) {
        for entry in self.entries.iter_mut() {
            if entry.index > up_to {
                break;
            }
            entry.committed = true;
        }
    }
}
