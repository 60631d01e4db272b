//! # context
//!
//! why: one coherent, invariant-checked view of a node's consensus state
//! relations: owns term.rs, log.rs, peers.rs and (lazily) snapshot.rs; the role
//! driver reads and mutates it, usually through participant.rs
//! what: RaftContext aggregate, recovery, commit/apply bookkeeping, payload version

use std::sync::{Arc, OnceLock};

use tracing::{debug, error, info};

use crate::config::ConfigParams;
use crate::error::{RaftError, Result};
use crate::log::{LogEntry, ReplicatedLog};
use crate::peers::PeerDirectory;
use crate::persistence::SharedGateway;
use crate::snapshot::SnapshotManager;
use crate::state_machine::StateMachine;
use crate::term::ElectionTerm;
use crate::{LogIndex, NodeId, Term};

/// Strategy returning the node's total memory in bytes.
pub type MemoryRetriever = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Physical memory as reported by the operating system.
pub fn runtime_total_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

/// Capability tag negotiated between nodes for wire-compatible behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PayloadVersion(pub u16);

impl PayloadVersion {
    pub const UNSET: Self = Self(0);
    pub const CURRENT: Self = Self(1);
}

impl std::fmt::Display for PayloadVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Per-node raft state: term, log, peers, commit and apply progress.
///
/// # Invariants
///
/// `last_applied <= commit_index <= log.last_index()`, and neither index
/// ever moves backwards. Every mutation below checks this and reports a
/// breach as `InvariantViolation` without changing anything.
///
/// A context is driven by one thread of control. It is `Send` so it can be
/// handed to a worker (see `participant`), but it does no locking of its own.
pub struct RaftContext {
    id: NodeId,
    term: ElectionTerm,
    log: ReplicatedLog,
    peers: PeerDirectory,
    commit_index: LogIndex,
    last_applied: LogIndex,
    config: ConfigParams,
    gateway: SharedGateway,
    memory_retriever: Option<MemoryRetriever>,
    snapshot_manager: OnceLock<Arc<SnapshotManager>>,
    payload_version: Option<PayloadVersion>,
}

impl std::fmt::Debug for RaftContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftContext")
            .field("id", &self.id)
            .field("term", &self.term)
            .field("log", &self.log)
            .field("peers", &self.peers)
            .field("commit_index", &self.commit_index)
            .field("last_applied", &self.last_applied)
            .field("payload_version", &self.payload_version)
            .finish()
    }
}

impl RaftContext {
    /// Rebuild a node's context from whatever the gateway has on disk.
    ///
    /// The log resumes right after the snapshot (if any) and both commit and
    /// apply progress start at the snapshot's last included index.
    pub fn recover(
        id: impl Into<NodeId>,
        peers: PeerDirectory,
        config: ConfigParams,
        gateway: SharedGateway,
    ) -> Result<Self> {
        config.validate()?;
        let id = id.into();
        let recovered = gateway.load_on_startup()?;

        let (snapshot_index, snapshot_term) = recovered
            .snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));

        let entries: Vec<LogEntry> = recovered
            .entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        let mut expected = snapshot_index + 1;
        for entry in &entries {
            if entry.index != expected {
                return Err(RaftError::LogSequence {
                    index: entry.index,
                    reason: format!("recovered log has a gap, expected index {}", expected),
                });
            }
            expected += 1;
        }

        info!(
            node = %id,
            term = recovered.current_term,
            snapshot_index,
            entries = entries.len(),
            "recovered raft context"
        );

        Ok(Self {
            term: ElectionTerm::new(recovered.current_term, recovered.voted_for, gateway.clone()),
            log: ReplicatedLog::restore(snapshot_index, snapshot_term, entries, gateway.clone()),
            peers,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            config,
            gateway,
            memory_retriever: None,
            snapshot_manager: OnceLock::new(),
            payload_version: None,
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ConfigParams {
        &self.config
    }

    pub fn set_config(&mut self, config: ConfigParams) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub(crate) fn gateway(&self) -> SharedGateway {
        self.gateway.clone()
    }

    // -- term --

    pub fn term(&self) -> &ElectionTerm {
        &self.term
    }

    pub fn current_term(&self) -> Term {
        self.term.current_term()
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.term.voted_for()
    }

    pub fn update_term(&mut self, term: Term, voted_for: Option<&str>) -> Result<()> {
        self.term.update(term, voted_for)
    }

    pub fn observe_term(&mut self, term: Term) -> Result<bool> {
        self.term.observe(term)
    }

    /// Decide a RequestVote: adopt a higher term, then grant only if the
    /// candidate's log is at least as up to date as ours and we have not
    /// voted for someone else in that term. The vote is durable on `true`.
    pub fn grant_vote(
        &mut self,
        term: Term,
        candidate: &str,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) -> Result<bool> {
        self.term.observe(term)?;
        if term < self.term.current_term() || !self.term.can_vote_for(term, candidate) {
            return Ok(false);
        }
        if !self.log.is_up_to_date(last_log_index, last_log_term) {
            debug!(node = %self.id, candidate, "candidate log behind ours, vote withheld");
            return Ok(false);
        }
        self.term.update(term, Some(candidate))?;
        Ok(true)
    }

    // -- log --

    pub fn log(&self) -> &ReplicatedLog {
        &self.log
    }

    pub(crate) fn log_mut(&mut self) -> &mut ReplicatedLog {
        &mut self.log
    }

    /// Append entries in order. No entry may carry a term above ours.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) -> Result<()> {
        self.check_entry_terms(&entries)?;
        self.log.append(entries)
    }

    /// Leader-side append of a new command in the current term.
    ///
    /// With no followers configured the entry is committed immediately.
    pub fn propose(&mut self, payload: Vec<u8>) -> Result<LogIndex> {
        let index = self.log.last_index() + 1;
        let term = self.current_term();
        self.log.append(vec![LogEntry::new(term, index, payload)])?;
        if !self.peers.has_followers() {
            self.set_commit_index(index)?;
        }
        Ok(index)
    }

    /// Follower-side merge of a leader's entries (see `ReplicatedLog::reconcile`).
    ///
    /// A conflict at or below the commit index means a committed entry would
    /// be overwritten; that is refused as an invariant violation.
    pub fn reconcile_entries(&mut self, entries: Vec<LogEntry>) -> Result<usize> {
        self.check_entry_terms(&entries)?;
        if let Some(conflict) = self.log.first_conflict(&entries) {
            if conflict <= self.commit_index {
                return Err(self.violation(format!(
                    "entry {} conflicts with committed prefix (commit index {})",
                    conflict, self.commit_index
                )));
            }
        }
        self.log.reconcile(entries)
    }

    /// Drop entries at or after `index`. Committed entries are never dropped.
    pub fn truncate_log_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Err(self.violation(format!(
                "truncation at {} would remove committed entries (commit index {})",
                index, self.commit_index
            )));
        }
        self.log.truncate_from(index)
    }

    fn check_entry_terms(&self, entries: &[LogEntry]) -> Result<()> {
        let current = self.current_term();
        match entries.iter().find(|e| e.term > current) {
            Some(entry) => Err(RaftError::LogSequence {
                index: entry.index,
                reason: format!("entry term {} exceeds current term {}", entry.term, current),
            }),
            None => Ok(()),
        }
    }

    // -- peers --

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerDirectory {
        &mut self.peers
    }

    pub fn has_followers(&self) -> bool {
        self.peers.has_followers()
    }

    /// Votes or acknowledgements needed, counting this node.
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    // -- commit / apply --

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        if index < self.commit_index {
            return Err(self.violation(format!(
                "commit index regression from {} to {}",
                self.commit_index, index
            )));
        }
        if index > self.log.last_index() {
            return Err(self.violation(format!(
                "commit index {} beyond last log index {}",
                index,
                self.log.last_index()
            )));
        }
        if index > self.commit_index {
            debug!(node = %self.id, from = self.commit_index, to = index, "commit index advanced");
            self.commit_index = index;
        }
        Ok(())
    }

    pub fn set_last_applied(&mut self, index: LogIndex) -> Result<()> {
        if index > self.commit_index {
            return Err(self.violation(format!(
                "last applied {} above commit index {}",
                index, self.commit_index
            )));
        }
        if index < self.last_applied {
            return Err(self.violation(format!(
                "last applied regression from {} to {}",
                self.last_applied, index
            )));
        }
        self.last_applied = index;
        Ok(())
    }

    /// Advance the commit index from follower match indexes.
    ///
    /// Only an entry from the current term is committed by counting; earlier
    /// entries are committed implicitly with it. Returns whether it moved.
    pub fn advance_commit(&mut self, match_indexes: &[LogIndex]) -> Result<bool> {
        let mut acknowledged: Vec<LogIndex> = match_indexes.to_vec();
        acknowledged.push(self.log.last_index());
        let quorum = self.quorum_size();
        if acknowledged.len() < quorum {
            return Ok(false);
        }
        acknowledged.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = acknowledged[quorum - 1].min(self.log.last_index());
        if candidate <= self.commit_index {
            return Ok(false);
        }
        if self.log.term_at(candidate) != Some(self.current_term()) {
            return Ok(false);
        }
        self.set_commit_index(candidate)?;
        Ok(true)
    }

    /// Apply every committed but unapplied entry, in order.
    ///
    /// `last_applied` moves after each successful apply, so a failure leaves
    /// it at the last entry that made it. Returns the number applied.
    pub fn apply_committed(&mut self, sm: &mut dyn StateMachine) -> Result<usize> {
        let mut applied = 0;
        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let entry = self.log.get(next).ok_or_else(|| RaftError::IndexOutOfRange {
                index: next,
                first: self.log.first_index(),
                last: self.log.last_index(),
            })?;
            sm.apply(entry)?;
            self.last_applied = next;
            applied += 1;
        }
        if applied > 0 {
            debug!(node = %self.id, applied, last_applied = self.last_applied, "applied committed entries");
        }
        Ok(applied)
    }

    /// Progress jump after a snapshot install.
    pub(crate) fn adopt_snapshot_progress(&mut self, index: LogIndex) {
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
    }

    // -- snapshots --

    /// The node's snapshot manager, built on first use.
    pub fn snapshot_manager(&self) -> Arc<SnapshotManager> {
        self.snapshot_manager
            .get_or_init(|| Arc::new(SnapshotManager::new(self)))
            .clone()
    }

    pub fn total_memory(&self) -> u64 {
        match &self.memory_retriever {
            Some(retriever) => retriever(),
            None => runtime_total_memory(),
        }
    }

    pub fn set_total_memory_retriever<F>(&mut self, retriever: F)
    where
        F: Fn() -> u64 + Send + Sync + 'static,
    {
        self.memory_retriever = Some(Arc::new(retriever));
    }

    // -- payload version --

    /// `PayloadVersion::UNSET` until negotiated.
    pub fn payload_version(&self) -> PayloadVersion {
        self.payload_version.unwrap_or(PayloadVersion::UNSET)
    }

    /// Record the negotiated version. Set once; repeating the same value is
    /// accepted, changing it is not.
    pub fn set_payload_version(&mut self, version: PayloadVersion) -> Result<()> {
        match self.payload_version {
            Some(current) if current != version => Err(self.violation(format!(
                "payload version already negotiated as {}, refusing {}",
                current, version
            ))),
            _ => {
                self.payload_version = Some(version);
                Ok(())
            }
        }
    }

    fn violation(&self, message: String) -> RaftError {
        error!(node = %self.id, %message, "invariant violation");
        RaftError::InvariantViolation(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;

    fn context(peers: &[&str]) -> RaftContext {
        let peers = peers
            .iter()
            .map(|p| (p.to_string(), Some(format!("{}:7000", p))))
            .collect();
        RaftContext::recover(
            "self",
            peers,
            ConfigParams::default(),
            MemoryPersistence::shared(),
        )
        .unwrap()
    }

    #[test]
    fn fresh_context_starts_empty() {
        let ctx = context(&[]);
        assert_eq!(ctx.current_term(), 0);
        assert_eq!(ctx.commit_index(), 0);
        assert_eq!(ctx.last_applied(), 0);
        assert!(!ctx.has_followers());
        assert_eq!(ctx.payload_version(), PayloadVersion::UNSET);
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(context(&[]).quorum_size(), 1);
        assert_eq!(context(&["a", "b"]).quorum_size(), 2);
        assert_eq!(context(&["a", "b", "c", "d"]).quorum_size(), 3);
    }

    #[test]
    fn snapshot_manager_is_memoized() {
        let ctx = context(&[]);
        let first = ctx.snapshot_manager();
        let second = ctx.snapshot_manager();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn memory_retriever_is_overridable() {
        let mut ctx = context(&[]);
        ctx.set_total_memory_retriever(|| 4096);
        assert_eq!(ctx.total_memory(), 4096);
    }

    #[test]
    fn payload_version_set_once() {
        let mut ctx = context(&[]);
        ctx.set_payload_version(PayloadVersion::CURRENT).unwrap();
        ctx.set_payload_version(PayloadVersion::CURRENT).unwrap();
        let err = ctx.set_payload_version(PayloadVersion(7)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ctx.payload_version(), PayloadVersion::CURRENT);
    }

    #[test]
    fn invalid_config_rejected_on_recover_and_set() {
        let bad = ConfigParams {
            max_append_batch: 0,
            ..Default::default()
        };
        assert!(RaftContext::recover(
            "n",
            PeerDirectory::new(),
            bad.clone(),
            MemoryPersistence::shared()
        )
        .is_err());

        let mut ctx = context(&[]);
        assert!(ctx.set_config(bad).is_err());
        assert_eq!(ctx.config(), &ConfigParams::default());
    }
}
