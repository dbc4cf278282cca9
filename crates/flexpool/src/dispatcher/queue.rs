//! Intake/output queue pair and migration of retired queues

use std::sync::Arc;

use async_channel::{Receiver, Sender};
use tokio::runtime::Handle;
use tracing::debug;

use super::Inner;
use crate::job::QueuedJob;

/// The bounded intake and output queues of one sizing
///
/// Both queues always share a capacity and are replaced together.
#[derive(Debug)]
pub(crate) struct QueuePair {
    pub(crate) intake_tx: Sender<QueuedJob>,
    pub(crate) intake_rx: Receiver<QueuedJob>,
    pub(crate) output_tx: Sender<QueuedJob>,
    pub(crate) output_rx: Receiver<QueuedJob>,
    capacity: usize,
}

impl QueuePair {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (intake_tx, intake_rx) = async_channel::bounded(capacity);
        let (output_tx, output_rx) = async_channel::bounded(capacity);
        Self {
            intake_tx,
            intake_rx,
            output_tx,
            output_rx,
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn intake_len(&self) -> usize {
        self.intake_rx.len()
    }

    pub(crate) fn output_len(&self) -> usize {
        self.output_rx.len()
    }

    /// Close both queues
    ///
    /// Blocked senders get their job back, blocked receivers wake once the
    /// queue is empty, and nothing new can be enqueued.
    pub(crate) fn close(&self) {
        self.intake_tx.close();
        self.output_tx.close();
    }

    /// Close the pair and drop every resident job
    ///
    /// Dropped jobs resolve their completions as abandoned. Returns how many
    /// were dropped.
    pub(crate) fn abandon(self) -> usize {
        self.close();
        drain_resident(&self.output_rx).len() + drain_resident(&self.intake_rx).len()
    }
}

/// Take the jobs resident in a closed queue
///
/// Bounded by the queue length at call time, so a drain never waits for
/// arrivals. Jobs that a worker or the relay pulls concurrently simply end
/// the drain early.
pub(crate) fn drain_resident(rx: &Receiver<QueuedJob>) -> Vec<QueuedJob> {
    let resident = rx.len();
    let mut jobs = Vec::with_capacity(resident);
    for _ in 0..resident {
        match rx.try_recv() {
            Ok(job) => jobs.push(job),
            Err(_) => break,
        }
    }
    jobs
}

/// Where drained jobs land in the overflow list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Ahead of everything (old output queue: these were next in line)
    Front,
    /// Behind everything (old intake queue)
    Back,
}

impl Inner {
    /// Swap in a fresh queue pair sized for `workers` and migrate the old one
    pub(crate) fn resize_queues(self: &Arc<Self>, workers: usize) {
        let capacity = self.config.capacity_for(workers);
        let retired = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.queues, QueuePair::new(capacity))
        };
        debug!(
            old_capacity = retired.capacity(),
            new_capacity = capacity,
            "Resized queues"
        );
        self.migrate(retired);
    }

    /// Move every job resident in a retired queue pair into the overflow list
    ///
    /// One short-lived drain task per queue, each counted in `migrations`
    /// until it has handed its jobs over.
    pub(crate) fn migrate(self: &Arc<Self>, retired: QueuePair) {
        retired.close();
        let QueuePair {
            intake_rx,
            output_rx,
            ..
        } = retired;

        self.spawn_drain(output_rx, Placement::Front);
        self.spawn_drain(intake_rx, Placement::Back);
    }

    fn spawn_drain(self: &Arc<Self>, rx: Receiver<QueuedJob>, placement: Placement) {
        let tracked = self.migrations.register();
        let inner = Arc::clone(self);
        let drain = move || {
            inner.absorb(drain_resident(&rx), placement);
            drop(tracked);
        };

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { drain() });
            }
            // Draining never waits, so without a runtime it runs inline
            Err(_) => drain(),
        }
    }

    /// Put drained jobs into the overflow list and wake the relay
    fn absorb(&self, jobs: Vec<QueuedJob>, placement: Placement) {
        let moved = jobs.len();
        if moved > 0 {
            let mut state = self.state.lock();
            match placement {
                Placement::Front => {
                    for job in jobs.into_iter().rev() {
                        state.overflow.push_front(job);
                    }
                }
                Placement::Back => state.overflow.extend(jobs),
            }
        }
        self.overflow_ready.notify_one();
        debug!(moved, ?placement, "Migrated resident jobs");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingJobs;

    fn job(pending: &Arc<PendingJobs>) -> QueuedJob {
        QueuedJob::new(|| async { anyhow::Ok(()) }, pending.register()).0
    }

    #[test]
    fn test_capacity_is_at_least_one() {
        assert_eq!(QueuePair::new(0).capacity(), 1);
        assert_eq!(QueuePair::new(8).capacity(), 8);
    }

    #[test]
    fn test_drain_stops_at_resident_jobs() {
        let pending = PendingJobs::new();
        let queues = QueuePair::new(4);
        for _ in 0..3 {
            queues.intake_tx.try_send(job(&pending)).unwrap();
        }

        queues.close();
        let drained = drain_resident(&queues.intake_rx);

        assert_eq!(drained.len(), 3);
        assert!(drain_resident(&queues.intake_rx).is_empty());
        assert_eq!(pending.count(), 3);
    }

    #[test]
    fn test_closed_queue_hands_job_back() {
        let pending = PendingJobs::new();
        let queues = QueuePair::new(1);
        queues.close();

        let rejected = queues.intake_tx.try_send(job(&pending));
        assert!(matches!(
            rejected,
            Err(async_channel::TrySendError::Closed(_))
        ));
    }

    #[test]
    fn test_abandon_releases_pending() {
        let pending = PendingJobs::new();
        let queues = QueuePair::new(4);
        queues.intake_tx.try_send(job(&pending)).unwrap();
        queues.output_tx.try_send(job(&pending)).unwrap();
        assert_eq!(pending.count(), 2);

        assert_eq!(queues.abandon(), 2);
        assert_eq!(pending.count(), 0);
    }
}
