//! # state_machine
//!
//! why: the application side of the boundary that committed entries flow into
//! relations: driven by context.rs (apply) and snapshot.rs (capture/restore)
//! what: StateMachine trait

use crate::error::Result;
use crate::log::LogEntry;

/// The replicated application. Implementations report their own failures as
/// `RaftError::StateMachine`.
pub trait StateMachine {
    /// Apply one committed entry. Called strictly in index order.
    fn apply(&mut self, entry: &LogEntry) -> Result<()>;

    /// Serialize the full state as of the last applied entry.
    fn capture_state(&mut self) -> Result<Vec<u8>>;

    /// Replace the full state with a previously captured blob. A failed
    /// install restores the image captured just before it.
    fn restore_state(&mut self, state: &[u8]) -> Result<()>;
}
