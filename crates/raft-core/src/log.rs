//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by context.rs, compacted by snapshot.rs, persisted via persistence.rs
//! what: LogEntry struct, ReplicatedLog with sequence checks, conflict truncation
//! and prefix compaction behind a synthetic (index, term) predecessor

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RaftError, Result};
use crate::persistence::SharedGateway;
use crate::{LogIndex, Term};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: LogIndex,
    /// Opaque command for the state machine
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: LogIndex, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// The retained suffix of the log plus the (index, term) of whatever came
/// before it.
///
/// An empty log and a fully compacted log are different states: the first
/// reports `(0, 0)` from `last_index`/`last_term`, the second reports the
/// last compacted entry.
pub struct ReplicatedLog {
    entries: VecDeque<LogEntry>,
    snapshot_index: LogIndex,
    snapshot_term: Term,
    data_size: usize,
    gateway: SharedGateway,
}

impl std::fmt::Debug for ReplicatedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedLog")
            .field("snapshot_index", &self.snapshot_index)
            .field("snapshot_term", &self.snapshot_term)
            .field("first_index", &self.first_index())
            .field("last_index", &self.last_index())
            .field("data_size", &self.data_size)
            .finish()
    }
}

impl ReplicatedLog {
    /// An empty log with no compacted prefix.
    pub fn new(gateway: SharedGateway) -> Self {
        Self::restore(0, 0, Vec::new(), gateway)
    }

    /// Rebuild an in-memory log from recovered parts. Nothing is written.
    ///
    /// Entries are assumed to be contiguous and to start right after
    /// `snapshot_index`; `context::RaftContext::recover` checks this.
    pub fn restore(
        snapshot_index: LogIndex,
        snapshot_term: Term,
        entries: Vec<LogEntry>,
        gateway: SharedGateway,
    ) -> Self {
        let data_size = entries.iter().map(LogEntry::size).sum();
        Self {
            entries: entries.into(),
            snapshot_index,
            snapshot_term,
            data_size,
            gateway,
        }
    }

    // -- lookups --

    /// First retained index. Equals `last_index() + 1` when nothing is retained.
    pub fn first_index(&self) -> LogIndex {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Index of the last compacted entry, 0 if nothing was compacted.
    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> Term {
        self.snapshot_term
    }

    pub fn is_compacted(&self) -> bool {
        self.snapshot_index > 0
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total payload bytes held by retained entries
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// The entry at `index`, or none when it was compacted away or not yet
    /// appended.
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        self.entries.get((index - self.first_index()) as usize)
    }

    /// Term of the entry at `index`, including the synthetic predecessor.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// AppendEntries consistency check: does our log hold `prev_term` at
    /// `prev_index`?
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Election restriction: is a log ending at `(last_index, last_term)` at
    /// least as up to date as ours?
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_index >= self.last_index())
    }

    /// Index of the first incoming entry whose term disagrees with ours.
    pub fn first_conflict(&self, entries: &[LogEntry]) -> Option<LogIndex> {
        entries
            .iter()
            .filter(|e| e.index > self.snapshot_index)
            .find(|e| matches!(self.term_at(e.index), Some(term) if term != e.term))
            .map(|e| e.index)
    }

    /// Up to `max` contiguous entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Result<Vec<LogEntry>> {
        if index < self.first_index() {
            return Err(self.out_of_range(index));
        }
        let start = (index - self.first_index()) as usize;
        Ok(self.entries.iter().skip(start).take(max).cloned().collect())
    }

    // -- mutations --

    /// Append entries that continue the log without gaps.
    ///
    /// The batch is validated as a whole and persisted before it becomes
    /// visible; on any failure the log is unchanged.
    pub fn append(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.check_sequence(&entries)?;

        self.gateway.persist_entries(&entries)?;

        debug!(
            first = entries[0].index,
            count = entries.len(),
            "appended entries"
        );
        for entry in entries {
            self.data_size += entry.size();
            self.entries.push_back(entry);
        }
        Ok(())
    }

    /// Remove every entry at or after `index`.
    ///
    /// Indexes past the end are a no-op. Indexes inside the compacted prefix
    /// fail with `IndexOutOfRange`.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index < self.first_index() {
            return Err(self.out_of_range(index));
        }
        if index > self.last_index() {
            return Ok(());
        }

        self.gateway.truncate(index)?;

        let keep = (index - self.first_index()) as usize;
        let removed: usize = self.entries.drain(keep..).map(|e| e.size()).sum();
        self.data_size -= removed;
        debug!(from = index, "truncated log");
        Ok(())
    }

    /// Merge entries received from a leader.
    ///
    /// Entries we already hold with the same term are skipped, the first
    /// term conflict truncates our log from that index, and whatever remains
    /// is appended. Returns the number of entries actually appended.
    ///
    /// A batch whose remainder is out of sequence is rejected before anything
    /// is truncated.
    pub fn reconcile(&mut self, entries: Vec<LogEntry>) -> Result<usize> {
        let mut pending = entries.into_iter().peekable();
        let mut conflict = None;

        while let Some(entry) = pending.peek() {
            if entry.index <= self.snapshot_index {
                // already covered by a snapshot, which only holds committed entries
                pending.next();
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    pending.next();
                }
                Some(_) => {
                    conflict = Some(entry.index);
                    break;
                }
                None => break,
            }
        }

        let rest: Vec<LogEntry> = pending.collect();
        if let Some(index) = conflict {
            let prev_term = self.term_at(index - 1).unwrap_or(0);
            Self::check_sequence_after(index - 1, prev_term, &rest)?;
            debug!(index, "conflicting entry, rewriting log suffix");
            self.truncate_from(index)?;
        }
        let appended = rest.len();
        self.append(rest)?;
        Ok(appended)
    }

    /// Discard entries at or before `upto_index`, keeping their last index
    /// and term as the synthetic predecessor.
    pub fn snapshot_prefix(&mut self, upto_index: LogIndex) -> Result<()> {
        if upto_index <= self.snapshot_index {
            return Ok(());
        }
        let term = match self.get(upto_index) {
            Some(entry) => entry.term,
            None => return Err(self.out_of_range(upto_index)),
        };

        self.gateway.purge_through(upto_index)?;
        self.drop_prefix(upto_index, term);
        debug!(upto = upto_index, term, "compacted log prefix");
        Ok(())
    }

    /// Rebase the log on an installed snapshot ending at `(index, term)`.
    ///
    /// If we hold a matching entry at `index` the suffix after it survives;
    /// otherwise the whole log is superseded by the snapshot.
    pub fn reset_to_snapshot(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }

        if self.term_at(index) == Some(term) {
            self.gateway.purge_through(index)?;
            self.drop_prefix(index, term);
            debug!(index, term, "snapshot installed, retained log suffix");
        } else {
            self.gateway.purge_through(self.last_index().max(index))?;
            self.entries.clear();
            self.data_size = 0;
            self.snapshot_index = index;
            self.snapshot_term = term;
            debug!(index, term, "snapshot installed, log discarded");
        }
        Ok(())
    }

    fn drop_prefix(&mut self, upto_index: LogIndex, term: Term) {
        let count = ((upto_index - self.snapshot_index) as usize).min(self.entries.len());
        let removed: usize = self.entries.drain(..count).map(|e| e.size()).sum();
        self.data_size -= removed;
        self.snapshot_index = upto_index;
        self.snapshot_term = term;
    }

    fn check_sequence(&self, entries: &[LogEntry]) -> Result<()> {
        Self::check_sequence_after(self.last_index(), self.last_term(), entries)
    }

    /// `entries` must continue directly after `(prev_index, prev_term)`.
    fn check_sequence_after(
        prev_index: LogIndex,
        prev_term: Term,
        entries: &[LogEntry],
    ) -> Result<()> {
        let mut expected = prev_index + 1;
        let mut prev_term = prev_term;
        for entry in entries {
            if entry.index != expected {
                return Err(RaftError::LogSequence {
                    index: entry.index,
                    reason: format!("expected index {}", expected),
                });
            }
            if entry.term < prev_term {
                return Err(RaftError::LogSequence {
                    index: entry.index,
                    reason: format!("term {} precedes previous term {}", entry.term, prev_term),
                });
            }
            expected += 1;
            prev_term = entry.term;
        }
        Ok(())
    }

    fn out_of_range(&self, index: LogIndex) -> RaftError {
        RaftError::IndexOutOfRange {
            index,
            first: self.first_index(),
            last: self.last_index(),
        }
    }
}
