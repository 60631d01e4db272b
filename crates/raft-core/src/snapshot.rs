//! # snapshot
//!
//! why: bound log growth without losing the ability to recover or catch up
//! relations: constructed lazily by context.rs, compacts log.rs, persists via
//! persistence.rs, captures/restores through state_machine.rs
//! what: Snapshot types, SnapshotManager with capture and chunked install phases

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::context::RaftContext;
use crate::error::{RaftError, Result};
use crate::persistence::SharedGateway;
use crate::state_machine::StateMachine;
use crate::{LogIndex, NodeId, Term};

/// State machine image covering every entry up to `last_included_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub state: Vec<u8>,
}

impl Snapshot {
    pub fn new(last_included_index: LogIndex, last_included_term: Term, state: Vec<u8>) -> Self {
        Self {
            last_included_index,
            last_included_term,
            state,
        }
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            last_included_index: self.last_included_index,
            last_included_term: self.last_included_term,
        }
    }
}

/// Identity of a snapshot without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}

impl SnapshotMeta {
    pub fn new(last_included_index: LogIndex, last_included_term: Term) -> Self {
        Self {
            last_included_index,
            last_included_term,
        }
    }
}

/// What the manager is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    Idle,
    Capturing(SnapshotMeta),
    Installing {
        meta: SnapshotMeta,
        chunks: u32,
        bytes: usize,
    },
}

/// Outcome of offering an incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallDecision {
    Accepted,
    /// Older than what we already applied
    Stale,
    /// Already covered by our latest snapshot, or a resend of the install
    /// in flight
    Duplicate,
    /// Accepted, then replaced by a newer install before it completed
    Superseded,
}

enum Phase {
    Idle,
    Capturing(SnapshotMeta),
    Installing {
        meta: SnapshotMeta,
        chunks: u32,
        buffer: Vec<u8>,
    },
}

struct ManagerState {
    phase: Phase,
    latest: Option<SnapshotMeta>,
}

/// Coordinates capture and install. At most one snapshot is in flight.
///
/// The manager keeps only its own phase; everything else is read from and
/// written to the context passed into each call.
pub struct SnapshotManager {
    node: NodeId,
    gateway: SharedGateway,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("node", &self.node)
            .field("phase", &self.phase())
            .field("latest", &self.latest())
            .finish()
    }
}

impl SnapshotManager {
    /// Build against a fully constructed context.
    pub fn new(ctx: &RaftContext) -> Self {
        let log = ctx.log();
        let latest = log
            .is_compacted()
            .then(|| SnapshotMeta::new(log.snapshot_index(), log.snapshot_term()));
        Self {
            node: ctx.id().to_owned(),
            gateway: ctx.gateway(),
            state: Mutex::new(ManagerState {
                phase: Phase::Idle,
                latest,
            }),
        }
    }

    pub fn phase(&self) -> SnapshotPhase {
        match &self.state.lock().phase {
            Phase::Idle => SnapshotPhase::Idle,
            Phase::Capturing(meta) => SnapshotPhase::Capturing(*meta),
            Phase::Installing {
                meta,
                chunks,
                buffer,
            } => SnapshotPhase::Installing {
                meta: *meta,
                chunks: *chunks,
                bytes: buffer.len(),
            },
        }
    }

    /// The most recent snapshot persisted or installed on this node.
    pub fn latest(&self) -> Option<SnapshotMeta> {
        self.state.lock().latest
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Idle)
    }

    // -- capture --

    /// Whether the retained, already applied part of the log has outgrown
    /// the configured entry count or memory share.
    pub fn should_capture(&self, ctx: &RaftContext) -> bool {
        if !self.is_idle() {
            return false;
        }
        let log = ctx.log();
        let applied_retained = ctx.last_applied().saturating_sub(log.snapshot_index());
        if applied_retained == 0 {
            return false;
        }
        let config = ctx.config();
        applied_retained >= config.snapshot_batch_count
            || log.data_size() as u64 > config.snapshot_data_threshold(ctx.total_memory())
    }

    /// Enter `Capturing` at the context's last applied index.
    ///
    /// Returns none when another snapshot is in flight or nothing new has
    /// been applied since the last one.
    pub fn begin_capture(&self, ctx: &RaftContext) -> Option<SnapshotMeta> {
        let target = ctx.last_applied();
        let log = ctx.log();
        if target <= log.snapshot_index() {
            return None;
        }
        let term = log.term_at(target)?;

        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Idle) {
            debug!(node = %self.node, "capture skipped, snapshot already in flight");
            return None;
        }
        let meta = SnapshotMeta::new(target, term);
        state.phase = Phase::Capturing(meta);
        debug!(node = %self.node, index = target, term, "capture started");
        Some(meta)
    }

    /// Persist a captured state and compact the log up to it.
    ///
    /// Returns false when the capture was superseded in the meantime. On a
    /// persistence failure the manager returns to `Idle`, the previous
    /// durable snapshot is untouched and the error is returned.
    pub fn complete_capture(
        &self,
        ctx: &mut RaftContext,
        meta: SnapshotMeta,
        state: Vec<u8>,
    ) -> Result<bool> {
        if !matches!(self.state.lock().phase, Phase::Capturing(m) if m == meta) {
            warn!(node = %self.node, index = meta.last_included_index, "discarding superseded capture");
            return Ok(false);
        }

        let snapshot = Snapshot::new(meta.last_included_index, meta.last_included_term, state);
        let outcome = self
            .gateway
            .persist_snapshot(&snapshot)
            .map_err(RaftError::from)
            .and_then(|_| ctx.log_mut().snapshot_prefix(meta.last_included_index));

        let mut guard = self.state.lock();
        guard.phase = Phase::Idle;
        outcome?;
        guard.latest = Some(meta);
        info!(
            node = %self.node,
            index = meta.last_included_index,
            term = meta.last_included_term,
            bytes = snapshot.state.len(),
            "snapshot captured"
        );
        Ok(true)
    }

    pub fn abort_capture(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Capturing(_)) {
            state.phase = Phase::Idle;
        }
    }

    /// One synchronous capture round. Any failure leaves the manager `Idle`
    /// so the next trigger can retry.
    pub fn capture(&self, ctx: &mut RaftContext, sm: &mut dyn StateMachine) -> Result<bool> {
        let Some(meta) = self.begin_capture(ctx) else {
            return Ok(false);
        };
        let state = match sm.capture_state() {
            Ok(state) => state,
            Err(e) => {
                self.abort_capture();
                return Err(e);
            }
        };
        self.complete_capture(ctx, meta, state)
    }

    /// Capture if the thresholds say so. Failures are logged and absorbed.
    pub fn capture_if_needed(&self, ctx: &mut RaftContext, sm: &mut dyn StateMachine) -> bool {
        if !self.should_capture(ctx) {
            return false;
        }
        match self.capture(ctx, sm) {
            Ok(captured) => captured,
            Err(e) => {
                warn!(node = %self.node, error = %e, "snapshot capture failed, will retry");
                false
            }
        }
    }

    // -- install --

    /// Offer an incoming snapshot from the leader.
    ///
    /// Stale and duplicate offers are no-ops. A higher-index offer replaces
    /// an older install in flight; anything else while installing fails with
    /// `SnapshotInProgress`. Accepting cancels a local capture.
    pub fn begin_install(&self, ctx: &RaftContext, meta: SnapshotMeta) -> Result<InstallDecision> {
        let index = meta.last_included_index;
        if index < ctx.last_applied() {
            warn!(node = %self.node, index, applied = ctx.last_applied(), "ignoring stale snapshot");
            return Ok(InstallDecision::Stale);
        }

        let mut state = self.state.lock();
        if state.latest.is_some_and(|l| index <= l.last_included_index) {
            debug!(node = %self.node, index, "ignoring duplicate snapshot");
            return Ok(InstallDecision::Duplicate);
        }

        match &state.phase {
            Phase::Installing { meta: current, .. } => {
                if *current == meta {
                    debug!(node = %self.node, index, "install already in flight, ignoring resend");
                    return Ok(InstallDecision::Duplicate);
                }
                if index <= current.last_included_index {
                    return Err(RaftError::SnapshotInProgress {
                        in_flight: current.last_included_index,
                    });
                }
                warn!(
                    node = %self.node,
                    old = current.last_included_index,
                    new = index,
                    "superseding in-flight install"
                );
            }
            Phase::Capturing(current) => {
                warn!(
                    node = %self.node,
                    capture = current.last_included_index,
                    install = index,
                    "install cancels in-flight capture"
                );
            }
            Phase::Idle => {}
        }

        state.phase = Phase::Installing {
            meta,
            chunks: 0,
            buffer: Vec::new(),
        };
        debug!(node = %self.node, index, term = meta.last_included_term, "install started");
        Ok(InstallDecision::Accepted)
    }

    /// Add the next chunk of the install identified by `meta`.
    ///
    /// Returns false, changing nothing, when that install is not in flight.
    pub fn append_chunk(&self, meta: SnapshotMeta, chunk: &[u8]) -> bool {
        let mut state = self.state.lock();
        match &mut state.phase {
            Phase::Installing {
                meta: current,
                chunks,
                buffer,
            } if *current == meta => {
                *chunks += 1;
                buffer.extend_from_slice(chunk);
                true
            }
            _ => {
                debug!(node = %self.node, index = meta.last_included_index, "dropping chunk for inactive install");
                false
            }
        }
    }

    /// Apply the assembled snapshot: restore the state machine, persist it,
    /// rebase the log and move commit/apply progress to its index.
    ///
    /// Returns false when `meta` is not the install in flight, or when the
    /// context applied past it while chunks were arriving.
    ///
    /// All or nothing: if any step fails the state machine is rolled back to
    /// its pre-install image and progress is left where it was. A failed
    /// rollback is reported as `InvariantViolation`.
    pub fn finish_install(
        &self,
        ctx: &mut RaftContext,
        meta: SnapshotMeta,
        sm: &mut dyn StateMachine,
    ) -> Result<bool> {
        let buffer = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Installing {
                    meta: current,
                    buffer,
                    ..
                } if current == meta => buffer,
                other => {
                    state.phase = other;
                    return Ok(false);
                }
            }
        };

        if meta.last_included_index < ctx.last_applied() {
            warn!(node = %self.node, index = meta.last_included_index, "install overtaken by local progress");
            return Ok(false);
        }

        let snapshot = Snapshot::new(meta.last_included_index, meta.last_included_term, buffer);
        let previous = sm.capture_state()?;
        // an unreadable blob must never become the durable snapshot
        let outcome = sm.restore_state(&snapshot.state).and_then(|_| {
            self.gateway.persist_snapshot(&snapshot)?;
            ctx.log_mut()
                .reset_to_snapshot(meta.last_included_index, meta.last_included_term)
        });
        if let Err(e) = outcome {
            warn!(
                node = %self.node,
                index = meta.last_included_index,
                error = %e,
                "install failed, rolling state machine back"
            );
            if let Err(rollback) = sm.restore_state(&previous) {
                let message = format!(
                    "state machine rollback after failed install at {} failed: {}",
                    meta.last_included_index, rollback
                );
                error!(node = %self.node, %message, "invariant violation");
                return Err(RaftError::InvariantViolation(message));
            }
            return Err(e);
        }
        ctx.adopt_snapshot_progress(meta.last_included_index);

        self.state.lock().latest = Some(meta);
        info!(
            node = %self.node,
            index = meta.last_included_index,
            term = meta.last_included_term,
            "snapshot installed"
        );
        Ok(true)
    }

    pub fn abort_install(&self) {
        let mut state = self.state.lock();
        if matches!(state.phase, Phase::Installing { .. }) {
            state.phase = Phase::Idle;
        }
    }

    /// Install a complete snapshot in one call.
    pub fn install(
        &self,
        ctx: &mut RaftContext,
        snapshot: Snapshot,
        sm: &mut dyn StateMachine,
    ) -> Result<InstallDecision> {
        let meta = snapshot.meta();
        let decision = self.begin_install(ctx, meta)?;
        if decision != InstallDecision::Accepted {
            return Ok(decision);
        }
        if !self.append_chunk(meta, &snapshot.state) {
            return Ok(InstallDecision::Superseded);
        }
        if !self.finish_install(ctx, meta, sm)? {
            if meta.last_included_index < ctx.last_applied() {
                return Ok(InstallDecision::Stale);
            }
            return Ok(InstallDecision::Superseded);
        }
        Ok(decision)
    }
}
