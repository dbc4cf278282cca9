//! Process-wide default dispatcher
//!
//! A convenience for programs that want one shared pool without passing a
//! handle around. The instance is built lazily on first use from
//! [`DispatcherConfig::from_env`]; every function here forwards to it.
//! Libraries and tests should prefer an explicitly owned [`Dispatcher`].

use std::future::Future;
use std::sync::OnceLock;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::job::{Completion, JobResult};

static INSTANCE: OnceLock<RwLock<Dispatcher>> = OnceLock::new();

fn slot(worker_count: Option<usize>) -> &'static RwLock<Dispatcher> {
    INSTANCE.get_or_init(|| {
        let mut config = DispatcherConfig::from_env();
        if let Some(count) = worker_count {
            config = config.with_worker_count(count);
        }
        RwLock::new(Dispatcher::with_config(config))
    })
}

/// The shared dispatcher, built with the environment configuration if needed
pub fn instance() -> Dispatcher {
    slot(None).read().clone()
}

/// The shared dispatcher, reconfigured to `worker_count` workers
///
/// The first call builds it with that count; later calls set the target and
/// converge the running instance to it.
pub async fn get(worker_count: usize) -> Dispatcher {
    let worker_count = worker_count.max(1);
    let dispatcher = slot(Some(worker_count)).read().clone();
    if dispatcher.current_worker_count() != worker_count
        || dispatcher.target_worker_count() != worker_count
    {
        dispatcher.set_target_worker_count(worker_count);
        dispatcher.auto_scale().await;
    }
    dispatcher
}

/// Discard the shared dispatcher and install a fresh, stopped one
///
/// The old instance is stopped immediately; its queued jobs resolve as
/// abandoned. The fresh instance keeps the old configuration and target.
pub async fn reset() -> Dispatcher {
    let current = instance();
    replace(current).await
}

/// Like [`reset`], but first waits for any rescale in progress
pub async fn safe_reset() -> Dispatcher {
    let current = instance();
    let _gate = current.rescale_gate().await;
    replace(current.clone()).await
}

async fn replace(current: Dispatcher) -> Dispatcher {
    current.stop(true).await;
    let abandoned = current.abandon_all();
    let fresh = current.rebuilt();
    *slot(None).write() = fresh.clone();
    info!(abandoned, "Shared dispatcher reset");
    fresh
}

/// Submit a job to the shared dispatcher
pub async fn add<F, Fut>(job: F) -> Completion
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    instance().add(job).await
}

/// Start the shared dispatcher
pub fn start() -> Result<()> {
    instance().start()
}

/// Start the shared dispatcher under a parent lifecycle token
pub fn start_with_token(parent: &CancellationToken) -> Result<()> {
    instance().start_with_token(parent)
}

/// Wait for every job submitted to the shared dispatcher
pub async fn wait() {
    instance().wait().await
}

/// Stop the shared dispatcher
pub async fn stop(immediate: bool) {
    instance().stop(immediate).await
}

/// Grow the shared dispatcher
pub async fn up_scale(workers: usize) {
    instance().up_scale(workers).await
}

/// Shrink the shared dispatcher
pub async fn down_scale(workers: usize) {
    instance().down_scale(workers).await
}

/// Converge the shared dispatcher to its target
pub async fn auto_scale() {
    instance().auto_scale().await
}

/// Start the observer on the shared dispatcher
pub fn start_worker_observer() -> Result<()> {
    instance().start_worker_observer()
}

/// Converged worker count of the shared dispatcher
pub async fn worker_count() -> usize {
    instance().worker_count().await
}
