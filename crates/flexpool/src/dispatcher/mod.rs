//! The dispatcher: job intake, lifecycle and shared state
//!
//! This module provides:
//! - [`Dispatcher`] - Cloneable handle to a resizable worker pool
//! - [`DispatcherStats`] - Point-in-time view of the pool
//!
//! # Architecture
//!
//! ```text
//!  add() ──▶ intake queue ──▶ Relay ──▶ overflow list ──▶ output queue ──▶ Workers
//!  (bounded, backpressure)     (1 task)   (unbounded)       (bounded)      (N tasks)
//!
//!  Scaler: swaps the queue pair, drains the old pair into the overflow list,
//!          grows or shrinks the worker set under the dispatcher lock
//!  Observer: converges the worker count to the target in the background
//! ```
//!
//! One coarse `parking_lot` mutex guards the worker set, overflow list and
//! queue handles. It is never held across an `.await`.

mod observer;
mod queue;
mod relay;
mod scaler;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::job::{Completion, JobResult, QueuedJob};
use crate::pending::PendingJobs;
use crate::worker::{JobSource, Worker, WorkerState};

use queue::QueuePair;

/// Point-in-time view of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Between a successful start and a stop
    pub running: bool,
    /// A rescale is in progress
    pub scaling: bool,
    /// Generation number, bumped by every stop
    pub generation: u64,
    /// Actual worker count
    pub workers: usize,
    /// Workers whose execution loop is still live
    pub running_workers: usize,
    /// Desired worker count
    pub target_workers: usize,
    /// Jobs submitted but not yet finished
    pub pending_jobs: usize,
    /// Jobs parked in the overflow list
    pub overflow_len: usize,
    /// Capacity of each of the intake and output queues
    pub queue_capacity: usize,
    /// Jobs resident in the intake queue
    pub intake_len: usize,
    /// Jobs resident in the output queue
    pub output_len: usize,
}

/// Values published to convergence waiters and the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Topology {
    pub(crate) workers: usize,
    pub(crate) target: usize,
    pub(crate) scaling: bool,
}

impl Topology {
    /// Worker count matches the target and no rescale is running
    pub(crate) fn is_converged(&self) -> bool {
        !self.scaling && self.workers == self.target
    }
}

/// Everything guarded by the dispatcher lock
#[derive(Debug)]
pub(crate) struct State {
    pub(crate) running: bool,
    pub(crate) generation: u64,
    pub(crate) queues: QueuePair,
    pub(crate) overflow: VecDeque<QueuedJob>,
    pub(crate) workers: Vec<Worker>,
    pub(crate) target: usize,
    /// Rotating start index for choosing workers to remove
    pub(crate) removal_cursor: usize,
    pub(crate) lifecycle: CancellationToken,
    pub(crate) relay: Option<JoinHandle<()>>,
    pub(crate) observer: Option<CancellationToken>,
}

pub(crate) struct Inner {
    pub(crate) config: DispatcherConfig,
    pub(crate) state: Mutex<State>,
    pub(crate) pending: Arc<PendingJobs>,
    /// Drain tasks still moving jobs out of retired queues
    pub(crate) migrations: Arc<PendingJobs>,
    /// Wakes the relay when jobs are put into the overflow list from outside
    pub(crate) overflow_ready: Arc<Notify>,
    /// Wakes the relay when a worker takes a job off the output queue
    pub(crate) slot_freed: Arc<Notify>,
    /// Serializes rescale operations
    pub(crate) rescale: tokio::sync::Mutex<()>,
    pub(crate) scaling: AtomicBool,
    pub(crate) topology: watch::Sender<Topology>,
}

impl Inner {
    /// Publish the current worker count, target and scaling flag
    pub(crate) fn publish(&self, state: &State) {
        self.topology.send_replace(Topology {
            workers: state.workers.len(),
            target: state.target,
            scaling: self.scaling.load(Ordering::SeqCst),
        });
    }

    /// Start every idle worker against the current lifecycle token
    pub(crate) fn start_idle_workers(
        self: &Arc<Self>,
        state: &mut State,
        runtime: &Handle,
    ) -> usize {
        let source = Arc::downgrade(self);
        let lifecycle = state.lifecycle.clone();
        let mut started = 0;
        for worker in state.workers.iter_mut().filter(|w| w.is_idle()) {
            worker.start(runtime, source.clone(), lifecycle.clone());
            started += 1;
        }
        started
    }

    fn intake_sender(&self) -> Sender<QueuedJob> {
        self.state.lock().queues.intake_tx.clone()
    }

    /// Drop every queued and parked job without running it
    ///
    /// Also cancels the observer; the instance is being discarded.
    fn abandon_all(&self) -> usize {
        let (retired, overflow) = {
            let mut state = self.state.lock();
            if let Some(observer) = state.observer.take() {
                observer.cancel();
            }
            let capacity = state.queues.capacity();
            (
                std::mem::replace(&mut state.queues, QueuePair::new(capacity)),
                std::mem::take(&mut state.overflow),
            )
        };
        retired.abandon() + overflow.len()
    }
}

impl JobSource for Inner {
    fn output_queue(&self) -> Receiver<QueuedJob> {
        self.state.lock().queues.output_rx.clone()
    }

    fn job_taken(&self) {
        self.slot_freed.notify_one();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.lifecycle.cancel();
        if let Some(observer) = state.observer.take() {
            observer.cancel();
        }
        state.queues.close();
    }
}

/// A dynamically resizable worker pool
///
/// Cloning the handle is cheap; all clones drive the same pool.
///
/// # Example
///
/// ```ignore
/// use flexpool::Dispatcher;
///
/// let dispatcher = Dispatcher::new(3);
///
/// let done = dispatcher.add(|| async {
///     // do the work
///     anyhow::Ok(())
/// }).await;
///
/// dispatcher.start()?;
/// dispatcher.up_scale(7).await;
///
/// done.await?;
/// dispatcher.stop(false).await;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Dispatcher {
    /// Create a stopped dispatcher with `worker_count` workers (at least 1)
    pub fn new(worker_count: usize) -> Self {
        Self::with_config(DispatcherConfig::new(worker_count))
    }

    /// Create a stopped dispatcher from a configuration
    ///
    /// Out-of-range values are coerced rather than rejected.
    pub fn with_config(config: DispatcherConfig) -> Self {
        let config = config.normalized();
        let workers: Vec<Worker> = (0..config.worker_count).map(|_| Worker::new()).collect();
        let target = workers.len();
        let (topology, _) = watch::channel(Topology {
            workers: target,
            target,
            scaling: false,
        });

        let state = State {
            running: false,
            generation: 0,
            queues: QueuePair::new(config.capacity_for(target)),
            overflow: VecDeque::new(),
            workers,
            target,
            removal_cursor: 0,
            lifecycle: CancellationToken::new(),
            relay: None,
            observer: None,
        };

        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                pending: PendingJobs::new(),
                migrations: PendingJobs::new(),
                overflow_ready: Arc::new(Notify::new()),
                slot_freed: Arc::new(Notify::new()),
                rescale: tokio::sync::Mutex::new(()),
                scaling: AtomicBool::new(false),
                topology,
            }),
        }
    }

    /// Configuration this dispatcher was built with
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Submit a job
    ///
    /// Waits only while the intake queue is full; a job is never dropped to
    /// make room. The returned [`Completion`] resolves once the job has run.
    /// Jobs may be added before [`start`](Self::start); they run once the
    /// dispatcher is started.
    pub async fn add<F, Fut>(&self, job: F) -> Completion
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let (mut queued, completion) = QueuedJob::new(job, self.inner.pending.register());
        loop {
            match self.inner.intake_sender().send(queued).await {
                Ok(()) => return completion,
                // The intake was retired by a rescale or stop while we
                // waited; retry on the live one
                Err(async_channel::SendError(job)) => queued = job,
            }
        }
    }

    /// Submit a job without waiting for intake capacity
    ///
    /// Fails with [`DispatchError::QueueFull`] instead of blocking.
    pub fn try_add<F, Fut>(&self, job: F) -> Result<Completion>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let (mut queued, completion) = QueuedJob::new(job, self.inner.pending.register());
        loop {
            match self.inner.intake_sender().try_send(queued) {
                Ok(()) => return Ok(completion),
                Err(TrySendError::Full(_)) => return Err(DispatchError::QueueFull),
                Err(TrySendError::Closed(job)) => queued = job,
            }
        }
    }

    /// Start the dispatcher with a fresh root lifecycle token
    pub fn start(&self) -> Result<()> {
        self.start_with_token(&CancellationToken::new())
    }

    /// Start the dispatcher with a lifecycle token derived from `parent`
    ///
    /// Cancelling `parent` stops the relay and every worker of this
    /// generation. Their loops end and `stats().running_workers` drops to
    /// zero, but the dispatcher still reports as running and keeps queued
    /// jobs until [`stop`](Self::stop) retires the generation.
    ///
    /// Calling this while already running keeps the current token and only
    /// starts workers that are still idle (e.g. after a rescale).
    pub fn start_with_token(&self, parent: &CancellationToken) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let mut state = self.inner.state.lock();

        if !state.running {
            state.lifecycle = parent.child_token();
            state.relay = Some(relay::spawn(
                &runtime,
                Arc::downgrade(&self.inner),
                state.lifecycle.clone(),
            ));
            state.running = true;
            info!(
                generation = state.generation,
                workers = state.workers.len(),
                "Dispatcher started"
            );
        }

        let started = self.inner.start_idle_workers(&mut state, &runtime);
        debug!(started, "Started idle workers");
        self.inner.publish(&state);
        Ok(())
    }

    /// Wait until every submitted job has finished
    ///
    /// Returns immediately when the dispatcher is not running. Jobs added
    /// while waiting extend the wait.
    pub async fn wait(&self) {
        if !self.is_running() {
            return;
        }
        self.inner.migrations.wait_idle().await;
        self.inner.pending.wait_idle().await;
    }

    /// Stop the dispatcher
    ///
    /// With `immediate == false` this first waits for every pending job.
    /// Either way the relay and workers of the current generation are
    /// cancelled and a fresh generation (new queues, new token, the same
    /// number of idle workers) takes over, so the handle can be started
    /// again.
    ///
    /// `immediate == true` is lossy: jobs not yet handed to a worker are
    /// dropped and their completions resolve to
    /// [`DispatchError::Abandoned`]. Jobs already executing run to the end.
    #[instrument(skip(self))]
    pub async fn stop(&self, immediate: bool) {
        if !self.is_running() {
            return;
        }

        if !immediate {
            warn!(
                pending = self.inner.pending.count(),
                "Waiting for pending jobs before stopping"
            );
            self.wait().await;
        }

        let (retired, old_workers, parked) = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }

            state.lifecycle.cancel();
            if let Some(observer) = state.observer.take() {
                observer.cancel();
            }

            let count = state.workers.len();
            let capacity = self.inner.config.capacity_for(count);
            let retired = std::mem::replace(&mut state.queues, QueuePair::new(capacity));
            let old_workers = std::mem::replace(
                &mut state.workers,
                (0..count).map(|_| Worker::new()).collect(),
            );
            let parked = if immediate {
                std::mem::take(&mut state.overflow)
            } else {
                VecDeque::new()
            };

            state.lifecycle = CancellationToken::new();
            state.relay = None;
            state.running = false;
            state.generation += 1;
            self.inner.publish(&state);
            (retired, old_workers, parked)
        };

        for mut worker in old_workers {
            worker.stop();
        }

        if immediate {
            let abandoned = retired.abandon() + parked.len();
            drop(parked);
            info!(abandoned, "Dispatcher stopped immediately");
        } else {
            self.inner.migrate(retired);
            info!("Dispatcher stopped");
        }
    }

    /// Drop everything queued or parked, without running it
    ///
    /// Used when discarding a dispatcher. Returns the number of jobs dropped.
    pub(crate) fn abandon_all(&self) -> usize {
        self.inner.abandon_all()
    }

    /// A stopped dispatcher with this one's configuration and target count
    pub(crate) fn rebuilt(&self) -> Self {
        let target = self.target_worker_count();
        Self::with_config(self.inner.config.clone().with_worker_count(target))
    }

    /// Between a successful start and a stop
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// A rescale is in progress
    pub fn is_scaling(&self) -> bool {
        self.inner.scaling.load(Ordering::SeqCst)
    }

    /// Jobs submitted but not yet finished
    pub fn pending_jobs(&self) -> usize {
        self.inner.pending.count()
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> DispatcherStats {
        let state = self.inner.state.lock();
        DispatcherStats {
            running: state.running,
            scaling: self.inner.scaling.load(Ordering::SeqCst),
            generation: state.generation,
            workers: state.workers.len(),
            running_workers: state
                .workers
                .iter()
                .filter(|w| w.state() == WorkerState::Running)
                .count(),
            target_workers: state.target,
            pending_jobs: self.inner.pending.count(),
            overflow_len: state.overflow.len(),
            queue_capacity: state.queues.capacity(),
            intake_len: state.queues.intake_len(),
            output_len: state.queues.output_len(),
        }
    }
}
