//! # participant
//!
//! why: keep a context single-writer without locks inside the core
//! relations: owns one RaftContext; message transport and role driver submit work here
//! what: tokio worker draining an ordered request queue, clonable handle

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context::RaftContext;
use crate::error::{RaftError, Result};

type Job = Box<dyn FnOnce(&mut RaftContext) + Send>;

enum Request {
    Run(Job),
    Stop,
}

/// A running worker that exclusively owns a node's context.
pub struct Participant {
    handle: ParticipantHandle,
    worker: JoinHandle<RaftContext>,
}

/// Submits work to a participant. Requests run one at a time, in the order
/// they were enqueued.
#[derive(Clone)]
pub struct ParticipantHandle {
    tx: mpsc::UnboundedSender<Request>,
}

impl Participant {
    /// Move `ctx` onto a dedicated tokio task. Must be called inside a runtime.
    pub fn spawn(ctx: RaftContext) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let worker = tokio::spawn(async move {
            let mut ctx = ctx;
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Run(job) => job(&mut ctx),
                    Request::Stop => break,
                }
            }
            debug!(node = %ctx.id(), "participant stopped");
            ctx
        });
        Self {
            handle: ParticipantHandle { tx },
            worker,
        }
    }

    pub fn handle(&self) -> ParticipantHandle {
        self.handle.clone()
    }

    /// Stop after everything already queued has run and hand the context back.
    pub async fn shutdown(self) -> Result<RaftContext> {
        let _ = self.handle.tx.send(Request::Stop);
        self.worker.await.map_err(|_| RaftError::ParticipantStopped)
    }
}

impl ParticipantHandle {
    /// Run `f` against the context on the worker and wait for its result.
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RaftContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        });
        self.tx
            .send(Request::Run(job))
            .map_err(|_| RaftError::ParticipantStopped)?;
        reply_rx.await.map_err(|_| RaftError::ParticipantStopped)
    }
}
