//! # raft-core
//!
//! why: the authoritative per-node raft state a role driver needs for
//! elections, replication and safe log compaction
//! relations: raft-storage implements the persistence boundary defined here
//! what: term record, replicated log, peer directory, snapshot manager,
//! the RaftContext aggregate and a single-writer participant worker

pub mod config;
pub mod context;
pub mod error;
pub mod log;
pub mod participant;
pub mod peers;
pub mod persistence;
pub mod snapshot;
pub mod state_machine;
pub mod term;

/// Logical election epoch
pub type Term = u64;
/// Position in the replicated log, 1-based; 0 means "before the first entry"
pub type LogIndex = u64;
/// Identifier of this node
pub type NodeId = String;
/// Identifier of another cluster member
pub type PeerId = String;

pub use config::ConfigParams;
pub use context::{runtime_total_memory, MemoryRetriever, PayloadVersion, RaftContext};
pub use error::{RaftError, Result};
pub use log::{LogEntry, ReplicatedLog};
pub use participant::{Participant, ParticipantHandle};
pub use peers::PeerDirectory;
pub use persistence::{MemoryPersistence, PersistenceGateway, RecoveredState, SharedGateway};
pub use snapshot::{InstallDecision, Snapshot, SnapshotManager, SnapshotMeta, SnapshotPhase};
pub use state_machine::StateMachine;
pub use term::ElectionTerm;
