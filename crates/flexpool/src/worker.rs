//! Workers
//!
//! A worker is one sequential execution loop pulling jobs from the shared
//! output queue.
//!
//! ```text
//!   Idle ──start──▶ Running ──stop / lifecycle cancelled──▶ Stopped
//! ```
//!
//! Stopped workers are never restarted; growing the pool again always
//! creates new instances.

use std::sync::Weak;

use async_channel::Receiver;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::job::QueuedJob;

/// Lifecycle state of a single worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created but not started
    Idle,
    /// Execution loop spawned
    Running,
    /// Stop signal sent; the loop exits once its current job (if any) returns
    Stopped,
}

/// Where a worker finds the queue it should pull from
///
/// Implemented by the dispatcher. Workers hold it weakly, so a worker never
/// keeps its dispatcher alive.
pub(crate) trait JobSource: Send + Sync + 'static {
    /// The live output queue, re-read after every job because rescaling
    /// replaces it
    fn output_queue(&self) -> Receiver<QueuedJob>;

    /// Called after every job pulled off the output queue
    fn job_taken(&self) {}
}

/// A single worker owned by the dispatcher's worker set
#[derive(Debug)]
pub(crate) struct Worker {
    id: Uuid,
    state: WorkerState,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            state: WorkerState::Idle,
            stop: CancellationToken::new(),
            handle: None,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Current state; a loop that ended on lifecycle cancellation reads as
    /// stopped even though no stop signal was sent
    pub(crate) fn state(&self) -> WorkerState {
        match self.state {
            WorkerState::Running if self.handle.as_ref().is_some_and(|h| h.is_finished()) => {
                WorkerState::Stopped
            }
            state => state,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// Spawn the execution loop bound to `lifecycle`
    ///
    /// No-op unless the worker is idle.
    pub(crate) fn start<S: JobSource>(
        &mut self,
        runtime: &Handle,
        source: Weak<S>,
        lifecycle: CancellationToken,
    ) {
        if !self.is_idle() {
            return;
        }

        let id = self.id;
        let stop = self.stop.clone();
        self.handle = Some(runtime.spawn(async move {
            run(source, stop, lifecycle).await;
            debug!(worker_id = %id, "Worker exited");
        }));
        self.state = WorkerState::Running;
    }

    /// Send the individual stop signal
    ///
    /// A job that is already executing runs to completion; the worker just
    /// never pulls another one.
    pub(crate) fn stop(&mut self) {
        if self.state == WorkerState::Running {
            self.stop.cancel();
            let busy = self.handle.as_ref().is_some_and(|h| !h.is_finished());
            trace!(worker_id = %self.id, busy, "Worker stop signalled");
        }
        self.state = WorkerState::Stopped;
    }

    /// True once the execution loop has returned
    #[cfg(test)]
    pub(crate) fn has_exited(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

async fn run<S: JobSource>(
    source: Weak<S>,
    stop: CancellationToken,
    lifecycle: CancellationToken,
) {
    loop {
        let Some(output) = source.upgrade().map(|s| s.output_queue()) else {
            break;
        };

        // Stop and cancellation win over a waiting job
        let job = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = lifecycle.cancelled() => break,
            received = output.recv() => match received {
                Ok(job) => {
                    if let Some(shared) = source.upgrade() {
                        shared.job_taken();
                    }
                    job
                }
                // Retired queue; fetch the live one
                Err(_) => continue,
            },
        };

        trace!("Executing job");
        job.execute().await;
    }
}
