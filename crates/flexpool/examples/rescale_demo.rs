//! Rescaling walkthrough using the shared dispatcher
//!
//! Queues a backlog of slow jobs, starts three workers, then grows and
//! shrinks the pool while the backlog drains.
//!
//! Run with: RUST_LOG=flexpool=debug cargo run -p flexpool --example rescale_demo

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use flexpool::global;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const JOBS: usize = 2_000;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flexpool=info,rescale_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dispatcher = global::get(3).await;
    dispatcher.start_worker_observer()?;

    let in_flight = Arc::new(AtomicUsize::new(0));
    for n in 0..JOBS {
        let in_flight = Arc::clone(&in_flight);
        // Completions are not awaited; wait() covers them
        let _ = dispatcher
            .add(move || async move {
                let running = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(job = n, running, "Job started");
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(())
            })
            .await;
    }
    dispatcher.start()?;

    for workers in [7, 2, 20] {
        tokio::time::sleep(Duration::from_secs(2)).await;
        if workers > dispatcher.current_worker_count() {
            global::up_scale(workers).await;
        } else {
            global::down_scale(workers).await;
        }
        let stats = dispatcher.stats();
        tracing::info!(
            workers = stats.workers,
            pending = stats.pending_jobs,
            running = in_flight.load(Ordering::SeqCst),
            "Rescaled"
        );
    }

    let last = dispatcher
        .add(|| async {
            tracing::info!("Last job");
            anyhow::Ok(())
        })
        .await;

    // The observer converges the pool to a new target
    dispatcher.set_target_worker_count(50);
    tracing::info!(workers = dispatcher.worker_count().await, "Target reached");

    dispatcher.wait().await;
    last.await?;

    dispatcher.stop(true).await;
    tracing::info!(stats = ?dispatcher.stats(), "Demo finished");
    Ok(())
}
