//! Live rescaling: grow, shrink, reconcile
//!
//! Only one rescale runs at a time per dispatcher (the `rescale` gate). A
//! concurrent request waits for the gate instead of failing or being
//! skipped. The `scaling` flag is published for convergence waiters and the
//! observer while the gate is held.

use std::sync::atomic::Ordering;

use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use super::{Dispatcher, Inner};
use crate::worker::Worker;

/// Raises the `scaling` flag for its lifetime
struct ScalingFlag<'a> {
    inner: &'a Inner,
}

impl<'a> ScalingFlag<'a> {
    fn raise(inner: &'a Inner) -> Self {
        inner.scaling.store(true, Ordering::SeqCst);
        inner.publish(&inner.state.lock());
        Self { inner }
    }
}

impl Drop for ScalingFlag<'_> {
    fn drop(&mut self) {
        self.inner.scaling.store(false, Ordering::SeqCst);
        self.inner.publish(&self.inner.state.lock());
    }
}

impl Dispatcher {
    /// Grow the pool to `workers` workers
    ///
    /// Queues are always resized to fit `workers`, with resident jobs
    /// migrated to the overflow list. New workers are appended and, if the
    /// dispatcher is running, started. Asking for fewer workers than exist
    /// leaves the worker set alone; the target becomes the larger of the two.
    #[instrument(skip(self))]
    pub async fn up_scale(&self, workers: usize) {
        let workers = workers.max(1);
        let _gate = self.inner.rescale.lock().await;
        let _flag = ScalingFlag::raise(&self.inner);

        self.inner.resize_queues(workers);

        let (before, after) = {
            let mut state = self.inner.state.lock();
            let before = state.workers.len();
            if workers > before {
                state.workers.extend((before..workers).map(|_| Worker::new()));
            }
            state.target = state.workers.len();

            if state.running {
                match Handle::try_current() {
                    Ok(runtime) => {
                        let started = self.inner.start_idle_workers(&mut state, &runtime);
                        debug!(started, "Started new workers");
                    }
                    Err(_) => warn!("No Tokio runtime, new workers stay idle until start"),
                }
            }
            (before, state.workers.len())
        };

        info!(before, after, "Scaled up");
    }

    /// Shrink the pool to `workers` workers
    ///
    /// Removal starts at a cursor that persists across calls and skips one
    /// worker after each removal, so repeated shrinks spread over the set
    /// instead of always taking the newest workers. A removed worker that is
    /// executing a job finishes it first. Asking for more workers than exist
    /// leaves the worker set alone; the target becomes the smaller of the two.
    #[instrument(skip(self))]
    pub async fn down_scale(&self, workers: usize) {
        let workers = workers.max(1);
        let _gate = self.inner.rescale.lock().await;
        let _flag = ScalingFlag::raise(&self.inner);

        self.inner.resize_queues(workers);

        let (before, removed) = {
            let mut state = self.inner.state.lock();
            let before = state.workers.len();
            let excess = before.saturating_sub(workers);

            let mut removed = Vec::with_capacity(excess);
            let mut idx = state.removal_cursor;
            for _ in 0..excess {
                if idx >= state.workers.len() {
                    idx = 0;
                }
                let mut worker = state.workers.remove(idx);
                worker.stop();
                removed.push(worker.id());

                idx += 1;
            }
            state.removal_cursor = if state.workers.is_empty() {
                0
            } else {
                idx % state.workers.len()
            };
            state.target = state.workers.len();
            (before, removed)
        };

        debug!(removed = ?removed, "Stopped workers");
        info!(before, after = before - removed.len(), "Scaled down");
    }

    /// Converge the worker count to the target
    ///
    /// Shrinks when there are too many workers, grows when there are too
    /// few, and does nothing otherwise.
    pub async fn auto_scale(&self) {
        let (actual, target) = {
            let state = self.inner.state.lock();
            (state.workers.len(), state.target)
        };

        if actual > target {
            self.down_scale(target).await;
        } else if actual < target {
            self.up_scale(target).await;
        }
    }

    /// Set the desired worker count without resizing
    ///
    /// The observer (or an explicit [`auto_scale`](Self::auto_scale))
    /// converges the pool afterwards.
    ///
    /// A direct [`up_scale`](Self::up_scale) or
    /// [`down_scale`](Self::down_scale) resets the target to the worker count
    /// it leaves behind, so a target set while such a call is waiting for the
    /// rescale gate is overwritten when it finishes.
    pub fn set_target_worker_count(&self, workers: usize) {
        let mut state = self.inner.state.lock();
        state.target = workers.max(1);
        self.inner.publish(&state);
    }

    /// Desired worker count
    pub fn target_worker_count(&self) -> usize {
        self.inner.state.lock().target
    }

    /// Actual worker count right now, without waiting for convergence
    pub fn current_worker_count(&self) -> usize {
        self.inner.state.lock().workers.len()
    }

    /// Worker count once no rescale is running and it matches the target
    ///
    /// Blocks (without spinning) until then. After
    /// [`set_target_worker_count`](Self::set_target_worker_count) this only
    /// returns once the observer or an `auto_scale` call has converged.
    pub async fn worker_count(&self) -> usize {
        let mut topology = self.inner.topology.subscribe();
        let workers = match topology.wait_for(|t| t.is_converged()).await {
            Ok(t) => t.workers,
            Err(_) => self.current_worker_count(),
        };
        workers
    }

    /// Hold the rescale gate, waiting for any rescale in progress
    pub(crate) async fn rescale_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.rescale.lock().await
    }
}

impl Inner {
    #[cfg(test)]
    pub(crate) fn removal_cursor(&self) -> usize {
        self.state.lock().removal_cursor
    }
}
