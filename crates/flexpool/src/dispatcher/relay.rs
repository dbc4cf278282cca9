//! Relay: intake queue -> overflow list -> output queue
//!
//! One relay task runs per running generation. It is the only task that
//! pops the head of the overflow list, so arrival order is preserved on the
//! way to the workers. Queue handles are re-read from the dispatcher on every
//! iteration because a rescale may swap them at any time.

use std::sync::{Arc, Weak};

use async_channel::TrySendError;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Inner;
use crate::job::QueuedJob;

/// Spawn the relay for the generation owning `lifecycle`
pub(crate) fn spawn(
    runtime: &Handle,
    inner: Weak<Inner>,
    lifecycle: CancellationToken,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        run(inner, lifecycle).await;
        debug!("Relay exited");
    })
}

async fn run(inner: Weak<Inner>, lifecycle: CancellationToken) {
    loop {
        if lifecycle.is_cancelled() {
            break;
        }

        // Only clones leave the lock; nothing below keeps the dispatcher alive
        let Some(shared) = inner.upgrade() else {
            break;
        };
        let (intake, output, head) = {
            let mut state = shared.state.lock();
            (
                state.queues.intake_rx.clone(),
                state.queues.output_tx.clone(),
                state.overflow.pop_front(),
            )
        };
        let ready = Arc::clone(&shared.overflow_ready);
        let slot_freed = Arc::clone(&shared.slot_freed);
        drop(shared);

        match head {
            Some(job) => match output.try_send(job) {
                Ok(()) => {}
                // Retired queue; the next iteration picks up the live one
                Err(TrySendError::Closed(job)) => requeue_front(&inner, job),
                // The job stays at the head of the list while we wait, so
                // cancellation never strands it in this task
                Err(TrySendError::Full(job)) => {
                    requeue_front(&inner, job);
                    tokio::select! {
                        biased;
                        _ = lifecycle.cancelled() => break,
                        _ = slot_freed.notified() => {}
                        _ = ready.notified() => {}
                    }
                }
            },
            None => {
                tokio::select! {
                    biased;
                    _ = lifecycle.cancelled() => break,
                    _ = ready.notified() => {}
                    received = intake.recv() => {
                        // An error means the intake was retired; the next
                        // iteration picks up the live one.
                        if let Ok(job) = received {
                            push_back(&inner, job);
                        }
                    }
                }
            }
        }
    }
}

fn push_back(inner: &Weak<Inner>, job: QueuedJob) {
    if let Some(shared) = inner.upgrade() {
        shared.state.lock().overflow.push_back(job);
    }
}

fn requeue_front(inner: &Weak<Inner>, job: QueuedJob) {
    if let Some(shared) = inner.upgrade() {
        shared.state.lock().overflow.push_front(job);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    use crate::{DispatchError, Dispatcher, DispatcherConfig};

    fn single_slot(workers: usize) -> Dispatcher {
        Dispatcher::with_config(
            DispatcherConfig::new(workers)
                .with_buffer_multiplier(1)
                .with_buffer_limit(1),
        )
    }

    fn relay_finished(dispatcher: &Dispatcher) -> Option<bool> {
        dispatcher
            .inner
            .state
            .lock()
            .relay
            .as_ref()
            .map(|h| h.is_finished())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_exits_on_cancel_with_full_output_queue() {
        let dispatcher = single_slot(1);
        let parent = CancellationToken::new();
        dispatcher.start_with_token(&parent).unwrap();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = dispatcher
            .add(move || async move {
                let _ = release_rx.await;
                anyhow::Ok(())
            })
            .await;
        let mut queued = Vec::new();
        for _ in 0..3 {
            queued.push(dispatcher.add(|| async { anyhow::Ok(()) }).await);
        }

        // Relay is holding a job for the full output queue
        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.stats().overflow_len == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay should park a job in the overflow list");

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while relay_finished(&dispatcher) != Some(true) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("relay should exit on lifecycle cancel");
        assert!(dispatcher.stats().overflow_len >= 1, "parked job must be kept");

        release_tx.send(()).unwrap();
        blocker.await.unwrap();

        // Nothing is stuck in the exited relay; stop accounts for every job
        dispatcher.stop(true).await;
        for completion in queued {
            let outcome = tokio::time::timeout(Duration::from_secs(1), completion)
                .await
                .expect("queued job should resolve");
            assert!(matches!(outcome, Err(DispatchError::Abandoned)));
        }
        assert_eq!(dispatcher.pending_jobs(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_refills_single_slot_output_queue() {
        let dispatcher = single_slot(2);
        let executed = Arc::new(AtomicUsize::new(0));
        dispatcher.start().unwrap();

        let mut completions = Vec::new();
        for _ in 0..50 {
            let executed = Arc::clone(&executed);
            completions.push(
                dispatcher
                    .add(move || async move {
                        executed.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    })
                    .await,
            );
        }

        for completion in completions {
            tokio::time::timeout(Duration::from_secs(2), completion)
                .await
                .expect("job should be relayed once a slot frees")
                .unwrap();
        }
        assert_eq!(executed.load(Ordering::SeqCst), 50);
        dispatcher.stop(false).await;
    }
}
