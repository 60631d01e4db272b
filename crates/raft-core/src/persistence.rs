//! # persistence
//!
//! why: make term, log and snapshot durable before anything is acknowledged
//! relations: implemented by raft-storage (files) and MemoryPersistence (tests,
//! single-process use); called by term.rs, log.rs and snapshot.rs
//! what: PersistenceGateway trait, RecoveredState, MemoryPersistence

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::log::LogEntry;
use crate::snapshot::Snapshot;
use crate::{LogIndex, PeerId, Term};

/// Durable storage boundary for a raft participant.
///
/// The term record, the log segment and the snapshot blob are disjoint
/// namespaces: each method touches exactly one of them. Every method must be
/// durable when it returns `Ok`.
pub trait PersistenceGateway: Send + Sync {
    /// persist the current term and the vote cast in it
    fn persist_term(&self, term: Term, voted_for: Option<&str>) -> io::Result<()>;

    /// append entries to the log segment
    fn persist_entries(&self, entries: &[LogEntry]) -> io::Result<()>;

    /// drop log entries at or after `from_index` (conflict resolution)
    fn truncate(&self, from_index: LogIndex) -> io::Result<()>;

    /// drop log entries at or before `index` (compaction)
    fn purge_through(&self, index: LogIndex) -> io::Result<()>;

    /// replace the stored snapshot; must be all-or-nothing
    fn persist_snapshot(&self, snapshot: &Snapshot) -> io::Result<()>;

    /// load everything needed to rebuild a context after a restart
    fn load_on_startup(&self) -> io::Result<RecoveredState>;
}

/// Durable state read back on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredState {
    pub current_term: Term,
    pub voted_for: Option<PeerId>,
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<Snapshot>,
}

pub type SharedGateway = Arc<dyn PersistenceGateway>;

#[derive(Debug, Default)]
struct MemoryInner {
    state: RecoveredState,
    failing: bool,
    writes: u64,
}

/// In-memory gateway. State survives as long as the value does, so tests can
/// rebuild a context from the same instance to simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryInner>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// While set, every write fails with an I/O error and changes nothing.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().failing = failing;
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> u64 {
        self.inner.lock().writes
    }

    fn write<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce(&mut RecoveredState),
    {
        let mut inner = self.inner.lock();
        if inner.failing {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        f(&mut inner.state);
        inner.writes += 1;
        Ok(())
    }
}

impl PersistenceGateway for MemoryPersistence {
    fn persist_term(&self, term: Term, voted_for: Option<&str>) -> io::Result<()> {
        self.write(|state| {
            state.current_term = term;
            state.voted_for = voted_for.map(str::to_owned);
        })
    }

    fn persist_entries(&self, entries: &[LogEntry]) -> io::Result<()> {
        self.write(|state| state.entries.extend(entries.iter().cloned()))
    }

    fn truncate(&self, from_index: LogIndex) -> io::Result<()> {
        self.write(|state| state.entries.retain(|e| e.index < from_index))
    }

    fn purge_through(&self, index: LogIndex) -> io::Result<()> {
        self.write(|state| state.entries.retain(|e| e.index > index))
    }

    fn persist_snapshot(&self, snapshot: &Snapshot) -> io::Result<()> {
        self.write(|state| state.snapshot = Some(snapshot.clone()))
    }

    fn load_on_startup(&self) -> io::Result<RecoveredState> {
        Ok(self.inner.lock().state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_writes_leave_state_untouched() {
        let gateway = MemoryPersistence::new();
        gateway.persist_term(3, Some("n1")).unwrap();

        gateway.set_failing(true);
        assert!(gateway.persist_term(4, None).is_err());
        assert!(gateway.persist_entries(&[LogEntry::new(4, 1, vec![1])]).is_err());
        gateway.set_failing(false);

        let state = gateway.load_on_startup().unwrap();
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for.as_deref(), Some("n1"));
        assert!(state.entries.is_empty());
        assert_eq!(gateway.writes(), 1);
    }

    #[test]
    fn truncate_and_purge_are_opposite_ends() {
        let gateway = MemoryPersistence::new();
        let entries: Vec<_> = (1..=5).map(|i| LogEntry::new(1, i, vec![])).collect();
        gateway.persist_entries(&entries).unwrap();

        gateway.truncate(5).unwrap();
        gateway.purge_through(2).unwrap();

        let indexes: Vec<_> = gateway
            .load_on_startup()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.index)
            .collect();
        assert_eq!(indexes, vec![3, 4]);
    }
}
