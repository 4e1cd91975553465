//! In-memory replicated log, rebuilt from the WAL on startup.

use std::collections::VecDeque;

use kestrel_common::error::{KestrelError, KestrelResult, RaftError, StorageError};
use kestrel_common::types::{LogIndex, Term};
use kestrel_storage::{WalRecord, WalReplay};
use serde::{Deserialize, Serialize};

use crate::membership::ClusterConfig;

/// What a log entry carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a fresh leader to commit prior-term entries promptly.
    NoOp,
    /// An opaque state-machine command.
    Command(Vec<u8>),
    /// A membership configuration, effective as soon as it is appended.
    Config(ClusterConfig),
}

/// A single entry in the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, payload: EntryPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    pub fn encode_payload(&self) -> KestrelResult<Vec<u8>> {
        bincode::serialize(&self.payload)
            .map_err(|e| KestrelError::Storage(StorageError::Codec(e.to_string())))
    }

    pub fn decode_payload(data: &[u8]) -> KestrelResult<EntryPayload> {
        bincode::deserialize(data)
            .map_err(|e| KestrelError::Storage(StorageError::Codec(e.to_string())))
    }
}

/// The log entries held in memory. Index 0 is a sentinel; real entries start
/// at 1. After compaction, `first_index` moves past the snapshot point and
/// `snapshot_term` remembers the term of the entry just before it.
#[derive(Debug)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    first_index: LogIndex,
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    /// Rebuild the log by folding replayed WAL records in order. Also
    /// returns the recovered hard state (term, voted_for).
    pub fn rebuild(replay: &WalReplay) -> KestrelResult<(Self, Term, Option<u64>)> {
        let mut log = Self::new();
        let mut term: Term = 0;
        let mut voted_for = None;

        for record in &replay.records {
            match record {
                WalRecord::HardState {
                    term: t,
                    voted_for: v,
                } => {
                    term = *t;
                    voted_for = *v;
                }
                WalRecord::Append {
                    index,
                    term: entry_term,
                    payload,
                } => {
                    if *index < log.first_index {
                        // Covered by a later Compact record's snapshot.
                        continue;
                    }
                    if *index <= log.last_index() {
                        log.truncate_from(*index);
                    }
                    let payload = LogEntry::decode_payload(payload)?;
                    log.append(LogEntry::new(*entry_term, *index, payload))?;
                }
                WalRecord::Truncate { from } => log.truncate_from(*from),
                WalRecord::Compact {
                    index,
                    term: compact_term,
                } => log.compact(*index, *compact_term),
            }
        }
        Ok((log, term, voted_for))
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, entry: LogEntry) -> KestrelResult<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(KestrelError::Internal(format!(
                "log append out of order: expected index {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// Term of the entry at `index`. Index 0 and the compaction point have
    /// known terms even though the entries themselves are gone.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Up to `limit` entries from `start_index`, or `LogCompacted` when the
    /// range begins below the retained log. The leader treats that as the
    /// signal to ship a snapshot instead.
    pub fn entries_from_checked(
        &self,
        start_index: LogIndex,
        limit: usize,
    ) -> Result<Vec<LogEntry>, RaftError> {
        if start_index < self.first_index {
            return Err(RaftError::LogCompacted {
                index: start_index,
                first_index: self.first_index,
            });
        }
        Ok(self.entries_from_limit(start_index, limit))
    }

    pub fn entries_from_limit(&self, start_index: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start_index > self.last_index() {
            return Vec::new();
        }
        let start = start_index.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from_limit(start, usize::MAX)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Drop entries at and above `index` (conflict resolution).
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// Consistency check for AppendEntries: do we hold `prev_log_term` at
    /// `prev_log_index`?
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        self.term_at(prev_log_index) == Some(prev_log_term)
    }

    /// Discard entries up to and including `up_to_index`; they are covered
    /// by a snapshot whose last entry had `snapshot_term`.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }
        let remove = ((up_to_index - self.first_index + 1) as usize).min(self.entries.len());
        for _ in 0..remove {
            self.entries.pop_front();
        }
        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election restriction: a candidate may only win if its log is at
    /// least as up-to-date as ours.
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }

    /// Latest membership configuration present in the log, with its index.
    pub fn latest_config(&self) -> Option<(LogIndex, ClusterConfig)> {
        self.entries.iter().rev().find_map(|e| match &e.payload {
            EntryPayload::Config(cfg) => Some((e.index, cfg.clone())),
            _ => None,
        })
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
