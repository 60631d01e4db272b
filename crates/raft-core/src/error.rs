//! # error
//!
//! why: give every consensus-state failure a distinct, matchable shape
//! relations: returned by term.rs, log.rs, peers.rs, snapshot.rs and context.rs
//! what: RaftError taxonomy, Result alias, recoverability classification

use thiserror::Error;

use crate::{LogIndex, PeerId, Term};

#[derive(Error, Debug)]
pub enum RaftError {
    /// A request carried a term older than ours. Safe to drop the message.
    #[error("stale term {presented}, current term is {current}")]
    StaleTerm { presented: Term, current: Term },

    /// A second, different vote was attempted within one term.
    #[error("already voted for {voted_for:?} in term {term}, refusing vote for {requested:?}")]
    AlreadyVoted {
        term: Term,
        voted_for: Option<PeerId>,
        requested: Option<PeerId>,
    },

    #[error("log sequence violation at index {index}: {reason}")]
    LogSequence { index: LogIndex, reason: String },

    #[error("index {index} is outside the retained log range [{first}, {last}]")]
    IndexOutOfRange {
        index: LogIndex,
        first: LogIndex,
        last: LogIndex,
    },

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("snapshot at index {in_flight} is already in progress")]
    SnapshotInProgress { in_flight: LogIndex },

    /// Programming error in the caller. Never retried, never downgraded.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("state machine failure: {0}")]
    StateMachine(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("participant worker has stopped")]
    ParticipantStopped,
}

impl RaftError {
    /// Stale or duplicate network effects; callers absorb these as no-ops.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleTerm { .. } | Self::AlreadyVoted { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Contention that clears up on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SnapshotInProgress { .. })
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(RaftError::StaleTerm { presented: 1, current: 2 }.is_stale());
        assert!(RaftError::AlreadyVoted {
            term: 3,
            voted_for: Some("a".into()),
            requested: Some("b".into()),
        }
        .is_stale());
        assert!(RaftError::InvariantViolation("x".into()).is_fatal());
        assert!(!RaftError::UnknownPeer("p".into()).is_fatal());
        assert!(RaftError::SnapshotInProgress { in_flight: 9 }.is_retryable());
    }

    #[test]
    fn io_errors_convert() {
        let err: RaftError = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, RaftError::Persistence(_)));
        assert!(err.to_string().contains("disk gone"));
    }
}
