//! # config
//!
//! why: carry the tunables the role driver and compaction policy read
//! relations: owned by context.rs, consulted by snapshot.rs for capture thresholds
//! what: ConfigParams with defaults and validation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Configuration for a raft participant.
///
/// Timeouts are in milliseconds. The core only stores and validates them;
/// the role driver owns the timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigParams {
    /// Minimum election timeout in milliseconds
    pub election_timeout_min: u64,
    /// Maximum election timeout in milliseconds
    pub election_timeout_max: u64,
    /// Leader heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
    /// Applied entries retained past the last snapshot before a capture is due
    pub snapshot_batch_count: u64,
    /// Share of total memory (percent) that retained payload may occupy
    pub snapshot_data_threshold_percentage: u8,
    /// Upper bound on entries handed out for a single replication message
    pub max_append_batch: usize,
}

impl Default for ConfigParams {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            snapshot_batch_count: 20_000,
            snapshot_data_threshold_percentage: 12,
            max_append_batch: 1000,
        }
    }
}

impl ConfigParams {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.snapshot_batch_count == 0 {
            return Err(RaftError::InvalidConfig(
                "snapshot_batch_count must be positive".into(),
            ));
        }
        if self.snapshot_data_threshold_percentage > 100 {
            return Err(RaftError::InvalidConfig(format!(
                "snapshot_data_threshold_percentage ({}) exceeds 100",
                self.snapshot_data_threshold_percentage
            )));
        }
        if self.max_append_batch == 0 {
            return Err(RaftError::InvalidConfig(
                "max_append_batch must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Payload byte budget for the retained log given the node's total memory.
    pub fn snapshot_data_threshold(&self, total_memory: u64) -> u64 {
        total_memory / 100 * u64::from(self.snapshot_data_threshold_percentage)
    }
}
