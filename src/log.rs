//! An in-memory, 1-indexed Raft log with a sentinel at index 0 (spec §4.3).

use serde::Deserialize;
use serde::Serialize;

use crate::message::Message;
use crate::state_machine::Operation;

/// A single Raft log entry.
///
/// `op` is `None` only for the sentinel at index 0. `msg` is the originating
/// client message, present only on the leader that first accepted it (spec
/// §3): followers that receive the entry via `append_entries` never populate
/// it, since they have no response channel to answer on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub op: Option<Operation>,
    #[serde(skip)]
    pub msg: Option<Message>,
}

impl Entry {
    pub fn sentinel() -> Self {
        Self {
            term: 0,
            op: None,
            msg: None,
        }
    }

    pub fn new(term: u64, op: Operation, msg: Message) -> Self {
        Self {
            term,
            op: Some(op),
            msg: Some(msg),
        }
    }
}

/// The Raft log. `entries[0]` is always the sentinel; real entries live at
/// `entries[1..]`, so `entries[i]` is the entry at 1-indexed position `i`.
#[derive(Clone, Debug, Default)]
pub struct Log {
    entries: Vec<Entry>,
}

impl Log {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::sentinel()],
        }
    }

    /// The entry at index `i`. `get(0)` is always the sentinel.
    ///
    /// Panics if `i` is out of range -- callers are expected to have already
    /// validated `i <= size()` per the `append_entries` protocol (spec §4.5).
    pub fn get(&self, i: u64) -> &Entry {
        &self.entries[i as usize]
    }

    /// Append `new_entries` to the end of the log.
    pub fn append(&mut self, new_entries: impl IntoIterator<Item = Entry>) {
        self.entries.extend(new_entries);
    }

    /// Retain entries at indices `1..=i`, dropping everything after.
    pub fn truncate(&mut self, i: u64) {
        self.entries.truncate(i as usize + 1);
    }

    /// The suffix of the log starting at index `i` (`i >= 1`).
    pub fn from(&self, i: u64) -> Vec<Entry> {
        if (i as usize) >= self.entries.len() {
            return Vec::new();
        }
        self.entries[i as usize..].to_vec()
    }

    /// The number of real entries (excluding the sentinel).
    pub fn size(&self) -> u64 {
        (self.entries.len() - 1) as u64
    }

    /// The term of the last entry, 0 when the log is empty.
    pub fn last_term(&self) -> u64 {
        self.get(self.size()).term
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Operation;

    fn entry(term: u64) -> Entry {
        Entry {
            term,
            op: Some(Operation::Write { key: 1, value: 1 }),
            msg: None,
        }
    }

    #[test]
    fn empty_log_has_sentinel_and_zero_last_term() {
        let log = Log::new();
        assert_eq!(log.size(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(*log.get(0), Entry::sentinel());
    }

    #[test]
    fn append_extends_and_last_term_tracks_tail() {
        let mut log = Log::new();
        log.append(vec![entry(1), entry(1), entry(2)]);
        assert_eq!(log.size(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(1).term, 1);
        assert_eq!(log.get(3).term, 2);
    }

    #[test]
    fn truncate_to_current_size_is_a_no_op() {
        let mut log = Log::new();
        log.append(vec![entry(1), entry(2)]);
        let before = log.from(1);
        log.truncate(log.size());
        assert_eq!(log.from(1), before);
    }

    #[test]
    fn truncate_drops_the_tail() {
        let mut log = Log::new();
        log.append(vec![entry(1), entry(2), entry(3)]);
        log.truncate(1);
        assert_eq!(log.size(), 1);
        assert_eq!(log.last_term(), 1);
    }

    #[test]
    fn from_returns_suffix_and_append_reconstructs_tail() {
        let mut log = Log::new();
        log.append(vec![entry(1), entry(2), entry(3)]);
        let tail = log.from(2);
        assert_eq!(tail.len(), 2);

        let mut rebuilt = Log::new();
        rebuilt.append(vec![entry(1)]);
        rebuilt.append(tail);
        assert_eq!(rebuilt.size(), log.size());
        assert_eq!(rebuilt.last_term(), log.last_term());
    }

    #[test]
    fn from_past_the_end_is_empty() {
        let log = Log::new();
        assert!(log.from(1).is_empty());
    }
}
