//! Pending-job accounting
//!
//! Counts jobs that were submitted but have not yet finished. Every
//! registration hands out a [`PendingGuard`]; the count drops when the guard
//! does, so a job that is abandoned in a discarded queue is released the same
//! way as one that ran.

use std::sync::Arc;

use tokio::sync::watch;

/// Submitted-but-unfinished job counter
#[derive(Debug)]
pub(crate) struct PendingJobs {
    count: watch::Sender<usize>,
}

impl PendingJobs {
    pub(crate) fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self { count })
    }

    /// Count one more pending job
    pub(crate) fn register(self: &Arc<Self>) -> PendingGuard {
        self.count.send_modify(|n| *n += 1);
        PendingGuard {
            pending: Arc::clone(self),
        }
    }

    /// Current number of pending jobs
    pub(crate) fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once the count reaches zero
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so this only errors if it was dropped
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn release(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Releases one pending slot when dropped
#[derive(Debug)]
pub(crate) struct PendingGuard {
    pending: Arc<PendingJobs>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.release();
    }
}
