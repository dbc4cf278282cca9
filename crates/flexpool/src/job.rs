//! Jobs and their completion signals

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::DispatchError;
use crate::pending::PendingGuard;

/// What a job returns; errors are handed back to the submitter untouched
pub type JobResult = anyhow::Result<()>;

type JobFn = Box<dyn FnOnce() -> BoxFuture<'static, JobResult> + Send>;

/// A submitted job waiting in a queue or the overflow list
pub(crate) struct QueuedJob {
    run: JobFn,
    done: oneshot::Sender<Result<(), DispatchError>>,
    pending: PendingGuard,
}

impl QueuedJob {
    /// Wrap a job closure and pair it with its completion signal
    pub(crate) fn new<F, Fut>(job: F, pending: PendingGuard) -> (Self, Completion)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let queued = Self {
            run: Box::new(move || job().boxed()),
            done,
            pending,
        };
        (queued, Completion { rx })
    }

    /// Execute the job to completion, then release its pending slot
    ///
    /// A panicking job is reported as [`DispatchError::Panicked`]; the
    /// calling worker keeps running.
    pub(crate) async fn execute(self) {
        let Self { run, done, pending } = self;

        let outcome = match AssertUnwindSafe(async move { run().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(DispatchError::Job(err)),
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        };

        // The submitter may have dropped its completion
        let _ = done.send(outcome);
        drop(pending);
    }
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob").finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Single-use completion signal returned by `add`
///
/// Resolves to `Ok(())` when the job succeeded, [`DispatchError::Job`] with
/// the job's own error, [`DispatchError::Panicked`] if it panicked, or
/// [`DispatchError::Abandoned`] if the job was dropped without running
/// (immediate stop, reset).
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), DispatchError>>,
}

impl Completion {
    /// Check for an outcome without waiting
    ///
    /// Returns `None` while the job is still queued or running. Once this
    /// has returned `Some`, the completion must not be awaited.
    pub fn try_outcome(&mut self) -> Option<Result<(), DispatchError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(DispatchError::Abandoned)),
        }
    }
}

impl Future for Completion {
    type Output = Result<(), DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Abandoned)))
    }
}
