//! Integration tests for the dispatcher
//!
//! Run with: cargo test -p flexpool --test dispatcher_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use flexpool::prelude::*;

/// Records how many times each job marker was executed
#[derive(Clone, Default)]
struct Ledger {
    runs: Arc<Mutex<HashMap<usize, usize>>>,
}

impl Ledger {
    fn job(
        &self,
        marker: usize,
        work: Duration,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, JobResult> + Send + 'static {
        let runs = Arc::clone(&self.runs);
        move || {
            Box::pin(async move {
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                *runs.lock().entry(marker).or_insert(0) += 1;
                Ok(())
            })
        }
    }

    fn assert_each_ran_once(&self, markers: std::ops::Range<usize>) {
        let runs = self.runs.lock();
        for marker in markers.clone() {
            assert_eq!(
                runs.get(&marker).copied(),
                Some(1),
                "job {marker} should run exactly once"
            );
        }
        assert_eq!(runs.len(), markers.len(), "unexpected extra jobs ran");
    }
}

async fn await_all(completions: Vec<Completion>, limit: Duration) {
    for (i, completion) in completions.into_iter().enumerate() {
        tokio::time::timeout(limit, completion)
            .await
            .unwrap_or_else(|_| panic!("job {i} did not complete in time"))
            .unwrap_or_else(|e| panic!("job {i} failed: {e}"));
    }
}

// ============================================
// Submission & Lifecycle
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_hundred_jobs_then_wait() {
    let dispatcher = Dispatcher::new(3);
    let ledger = Ledger::default();

    let mut completions = Vec::new();
    for marker in 0..100 {
        completions.push(dispatcher.add(ledger.job(marker, Duration::ZERO)).await);
    }

    dispatcher.start().unwrap();
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait())
        .await
        .expect("wait should return once all jobs ran");

    assert_eq!(dispatcher.pending_jobs(), 0);
    await_all(completions, Duration::from_secs(1)).await;
    ledger.assert_each_ran_once(0..100);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_job_error_reaches_submitter() {
    let dispatcher = Dispatcher::new(2);
    dispatcher.start().unwrap();

    let failed = dispatcher
        .add(|| async { Err::<(), _>(anyhow::anyhow!("checksum mismatch")) })
        .await;
    let succeeded = dispatcher.add(|| async { anyhow::Ok(()) }).await;

    match failed.await {
        Err(DispatchError::Job(err)) => assert_eq!(err.to_string(), "checksum mismatch"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(succeeded.await.is_ok());
    assert_eq!(dispatcher.pending_jobs(), 0);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_graceful_stop_drains_pending_jobs() {
    let dispatcher = Dispatcher::new(2);
    let ledger = Ledger::default();
    dispatcher.start().unwrap();

    for marker in 0..10 {
        dispatcher
            .add(ledger.job(marker, Duration::from_millis(20)))
            .await;
    }

    tokio::time::timeout(Duration::from_secs(5), dispatcher.stop(false))
        .await
        .expect("graceful stop should finish");

    ledger.assert_each_ran_once(0..10);
    assert!(!dispatcher.is_running());
    assert_eq!(dispatcher.pending_jobs(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_immediate_stop_is_prompt_and_lossy() {
    let dispatcher = Dispatcher::new(1);
    dispatcher.start().unwrap();

    let mut completions = Vec::new();
    for _ in 0..10 {
        completions.push(
            dispatcher
                .add(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    anyhow::Ok(())
                })
                .await,
        );
    }

    let started = Instant::now();
    dispatcher.stop(true).await;
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "immediate stop should not wait for jobs"
    );

    let mut succeeded = 0;
    let mut abandoned = 0;
    for completion in completions {
        match tokio::time::timeout(Duration::from_millis(500), completion).await {
            Ok(Ok(())) => succeeded += 1,
            Ok(Err(DispatchError::Abandoned)) => abandoned += 1,
            Ok(Err(other)) => panic!("unexpected outcome: {other}"),
            Err(_) => panic!("job outcome never resolved"),
        }
    }

    assert!(succeeded <= 2, "at most the in-flight job should finish");
    assert!(abandoned >= 5, "queued jobs should be abandoned");
    assert_eq!(dispatcher.stats().generation, 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_handle_is_reusable_after_stop() {
    let dispatcher = Dispatcher::new(2);
    let ledger = Ledger::default();

    dispatcher.start().unwrap();
    dispatcher.add(ledger.job(0, Duration::ZERO)).await;
    dispatcher.stop(false).await;

    // Added to the new generation while stopped
    let late = dispatcher.add(ledger.job(1, Duration::ZERO)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ledger.runs.lock().get(&1), None);

    dispatcher.start().unwrap();
    await_all(vec![late], Duration::from_secs(2)).await;
    ledger.assert_each_ran_once(0..2);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_parent_token_cancels_generation() {
    let dispatcher = Dispatcher::new(2);
    let parent = CancellationToken::new();
    dispatcher.start_with_token(&parent).unwrap();

    parent.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut parked = dispatcher.add(|| async { anyhow::Ok(()) }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(parked.try_outcome().is_none(), "cancelled workers must not run jobs");

    dispatcher.stop(true).await;
    let outcome = tokio::time::timeout(Duration::from_secs(1), parked)
        .await
        .expect("abandoned job should resolve");
    assert!(matches!(outcome, Err(DispatchError::Abandoned)));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_single_worker_runs_jobs_in_arrival_order() {
    let dispatcher = Dispatcher::with_config(
        DispatcherConfig::new(1)
            .with_buffer_multiplier(4)
            .with_buffer_limit(4),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    dispatcher.start().unwrap();

    let mut completions = Vec::new();
    for marker in 0..300usize {
        let order = Arc::clone(&order);
        completions.push(
            dispatcher
                .add(move || async move {
                    order.lock().push(marker);
                    anyhow::Ok(())
                })
                .await,
        );
    }
    await_all(completions, Duration::from_secs(10)).await;

    let order = order.lock();
    assert_eq!(order.len(), 300);
    let inversions = order.windows(2).filter(|pair| pair[0] > pair[1]).count();
    assert_eq!(inversions, 0, "jobs must run in arrival order");

    dispatcher.stop(false).await;
}

// ============================================
// Rescaling
// ============================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_up_scale_keeps_queued_jobs_exactly_once() {
    let dispatcher = Dispatcher::new(3);
    let ledger = Ledger::default();

    let mut completions = Vec::new();
    for marker in 0..200 {
        completions.push(
            dispatcher
                .add(ledger.job(marker, Duration::from_millis(2)))
                .await,
        );
    }
    dispatcher.start().unwrap();

    dispatcher.up_scale(7).await;
    assert_eq!(dispatcher.worker_count().await, 7);

    await_all(completions, Duration::from_secs(10)).await;
    ledger.assert_each_ran_once(0..200);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_down_scale_keeps_output_queue_jobs() {
    let dispatcher = Dispatcher::new(5);
    let ledger = Ledger::default();
    dispatcher.start().unwrap();

    let mut completions = Vec::new();
    for marker in 0..100 {
        completions.push(
            dispatcher
                .add(ledger.job(marker, Duration::from_millis(5)))
                .await,
        );
    }

    dispatcher.down_scale(2).await;
    assert_eq!(dispatcher.worker_count().await, 2);
    assert_eq!(dispatcher.stats().running_workers, 2);

    await_all(completions, Duration::from_secs(10)).await;
    ledger.assert_each_ran_once(0..100);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_rescale_during_continuous_submission() {
    let dispatcher = Dispatcher::with_config(
        DispatcherConfig::new(4)
            .with_buffer_multiplier(4)
            .with_buffer_limit(64),
    );
    let ledger = Ledger::default();
    dispatcher.start().unwrap();

    let producer = {
        let dispatcher = dispatcher.clone();
        let ledger = ledger.clone();
        tokio::spawn(async move {
            let mut completions = Vec::new();
            for marker in 0..500 {
                completions.push(
                    dispatcher
                        .add(ledger.job(marker, Duration::from_micros(200)))
                        .await,
                );
                if marker % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            completions
        })
    };

    for _ in 0..5 {
        dispatcher.down_scale(2).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        dispatcher.up_scale(2).await;
        dispatcher.up_scale(6).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let completions = producer.await.unwrap();
    await_all(completions, Duration::from_secs(20)).await;
    ledger.assert_each_ran_once(0..500);
    assert_eq!(dispatcher.worker_count().await, 6);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_scale_sequences_converge() {
    let dispatcher = Dispatcher::new(1);
    dispatcher.start().unwrap();

    for n in [5, 2, 9, 9, 1, 3, 0, 4] {
        if n >= dispatcher.current_worker_count() {
            dispatcher.up_scale(n).await;
        } else {
            dispatcher.down_scale(n).await;
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.workers, stats.target_workers);
        assert_eq!(stats.workers, n.max(1));
        assert_eq!(stats.running_workers, stats.workers);
    }

    dispatcher.stop(true).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_observer_follows_target_while_jobs_run() {
    let dispatcher = Dispatcher::new(2);
    let executed = Arc::new(AtomicUsize::new(0));
    dispatcher.start().unwrap();
    dispatcher.start_worker_observer().unwrap();

    let mut completions = Vec::new();
    for _ in 0..50 {
        let executed = Arc::clone(&executed);
        completions.push(
            dispatcher
                .add(move || async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    executed.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                })
                .await,
        );
    }

    dispatcher.set_target_worker_count(8);
    let count = tokio::time::timeout(Duration::from_secs(2), dispatcher.worker_count())
        .await
        .expect("observer should converge");
    assert_eq!(count, 8);

    await_all(completions, Duration::from_secs(5)).await;
    assert_eq!(executed.load(Ordering::SeqCst), 50);

    dispatcher.stop(false).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_backpressure_blocks_add_until_workers_drain() {
    let dispatcher = Dispatcher::with_config(
        DispatcherConfig::new(1)
            .with_buffer_multiplier(1)
            .with_buffer_limit(1),
    );

    // Not started: one job fits in the intake queue, the next must wait
    dispatcher.add(|| async { anyhow::Ok(()) }).await;
    let blocked = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.add(|| async { anyhow::Ok(()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished(), "add should wait for intake capacity");

    dispatcher.start().unwrap();
    let completion = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("add should proceed once the relay drains intake")
        .unwrap();
    completion.await.unwrap();

    dispatcher.stop(false).await;
    assert_eq!(dispatcher.pending_jobs(), 0);
}
