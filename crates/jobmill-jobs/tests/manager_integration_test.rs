//! Integration tests for JobManager over the in-memory store.
//!
//! This test suite validates:
//! - Successful jobs are deleted from the store
//! - Failed jobs are marked `error` with the failure recorded
//! - Records sharing a name never run concurrently
//! - A slow store never sees overlapping poll steps
//! - Store errors do not stop the loop
//! - Enqueue wake-ups, stats reporting and lifecycle (init/shutdown)
//! - Overlapping shutdowns wait for the filler to stop

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{sleep, timeout};

use jobmill_db::MemoryJobStore;
use jobmill_jobs::{
    EchoHandler, FnHandler, HandlerRegistry, JobContext, JobManager, JobStatus, JobStore, NewJob,
    WorkerConfig, WorkerEvent,
};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_workers(2)
        .with_poll_intervals(Duration::from_millis(10), Duration::from_millis(50))
        .with_idle_threshold(Duration::from_millis(200))
}

fn registry(gate: Arc<Semaphore>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_handler(EchoHandler)
        .with_handler(FnHandler::new("fail", |_ctx: JobContext| async move {
            Err::<JsonValue, _>(anyhow!("boom"))
        }))
        .with_handler(FnHandler::new("wait", move |ctx: JobContext| {
            let gate = gate.clone();
            async move {
                gate.acquire().await?.forget();
                Ok::<_, anyhow::Error>(ctx.data)
            }
        }))
}

fn manager(store: &MemoryJobStore, config: WorkerConfig) -> (JobManager, Arc<Semaphore>) {
    let gate = Arc::new(Semaphore::new(0));
    let manager = JobManager::new(Arc::new(store.clone()), registry(gate.clone()), config);
    (manager, gate)
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<WorkerEvent>,
    within: Duration,
    pred: F,
) -> Option<WorkerEvent>
where
    F: Fn(&WorkerEvent) -> bool,
{
    timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

fn drain(events: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ============================================================================
// SETTLEMENT
// ============================================================================

#[tokio::test]
async fn test_successful_job_is_deleted() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config());
    let mut events = manager.events();
    manager.init();

    let record = manager
        .add_job("greeting", NewJob::new("echo", json!({"hello": "world"})))
        .await
        .unwrap();
    assert_eq!(record.status, JobStatus::Queued);
    assert_eq!(record.metadata.retries, 0);

    let event = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobCompleted { .. })
    })
    .await
    .expect("job should complete");
    assert_eq!(
        event,
        WorkerEvent::JobCompleted {
            job_id: record.id,
            name: "greeting".to_string(),
        }
    );
    assert!(store.get(record.id).await.unwrap().is_none());

    assert!(manager.shutdown(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_failed_job_is_marked_error() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config());
    let mut events = manager.events();
    manager.init();

    let record = manager
        .add_job("nightly", NewJob::new("fail", json!({"day": 3})))
        .await
        .unwrap();

    let event = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobFailed { .. })
    })
    .await
    .expect("job should fail");
    assert_eq!(
        event,
        WorkerEvent::JobFailed {
            job_id: record.id,
            name: "nightly".to_string(),
            error: "boom".to_string(),
        }
    );

    let failed = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.metadata.retries, 1);
    assert_eq!(failed.metadata.error.as_deref(), Some("boom"));
    assert_eq!(failed.metadata.data, json!({"day": 3}));
    assert!(failed.finished_at.is_some());

    // The failed record is never picked up again.
    sleep(Duration::from_millis(100)).await;
    let again = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, WorkerEvent::JobDispatched { job_id, .. } if *job_id == record.id))
        .count();
    assert_eq!(again, 0);

    manager.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// DEDUP
// ============================================================================

#[tokio::test]
async fn test_same_name_runs_one_at_a_time() {
    let store = MemoryJobStore::new();
    let (manager, gate) = manager(&store, fast_config());
    let mut events = manager.events();
    manager.init();

    let first = manager
        .add_job("report", NewJob::new("wait", json!(1)))
        .await
        .unwrap();
    let second = manager
        .add_job("report", NewJob::new("wait", json!(2)))
        .await
        .unwrap();

    let dispatched = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobDispatched { .. })
    })
    .await
    .unwrap();
    assert!(matches!(dispatched, WorkerEvent::JobDispatched { job_id, .. } if job_id == first.id));

    // Several poll steps pass while the first job is blocked.
    sleep(Duration::from_millis(100)).await;
    let dispatched_again = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, WorkerEvent::JobDispatched { .. }))
        .count();
    assert_eq!(dispatched_again, 0);
    assert_eq!(manager.stats().pending_tasks, 1);
    assert_eq!(
        store.get(second.id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    gate.add_permits(1);
    let next = wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobDispatched { .. })
    })
    .await
    .unwrap();
    assert!(matches!(next, WorkerEvent::JobDispatched { job_id, .. } if job_id == second.id));
    assert!(store.get(first.id).await.unwrap().is_none());

    gate.add_permits(1);
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == second.id)
    })
    .await
    .unwrap();
    assert!(store.is_empty().await);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_distinct_names_run_concurrently() {
    let store = MemoryJobStore::new();
    let (manager, gate) = manager(&store, fast_config());
    manager.init();

    for name in ["a", "b"] {
        manager
            .add_job(name, NewJob::new("wait", JsonValue::Null))
            .await
            .unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while manager.stats().active_tasks < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both jobs should be running");

    gate.add_permits(2);
    timeout(Duration::from_secs(5), async {
        while !store.is_empty().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both records should be deleted");

    manager.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_never_overlaps() {
    let store = MemoryJobStore::new();
    store.set_fetch_delay(Some(Duration::from_secs(5)));
    let config = WorkerConfig::default().with_wake_on_enqueue(true);
    let (manager, _gate) = manager(&store, config);
    manager.init();

    // Enqueue wake-ups land while a step is still waiting on the store.
    for i in 0..5 {
        sleep(Duration::from_millis(1_500)).await;
        manager
            .add_job(&format!("job-{i}"), NewJob::new("echo", json!(i)))
            .await
            .unwrap();
    }
    sleep(Duration::from_secs(30)).await;

    assert!(store.fetch_count() >= 3);
    assert_eq!(store.peak_concurrent_fetches(), 1);
    assert!(store.is_empty().await);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_store_errors_do_not_stop_the_loop() {
    let store = MemoryJobStore::new();
    store.fail_next_fetches(2);
    let (manager, _gate) = manager(&store, fast_config());
    let mut events = manager.events();
    manager.init();

    for _ in 0..2 {
        wait_for_event(&mut events, Duration::from_secs(5), |e| {
            matches!(e, WorkerEvent::PollFailed { .. })
        })
        .await
        .expect("poll failure should be reported");
    }

    let record = manager
        .add_job("after-outage", NewJob::new("echo", JsonValue::Null))
        .await
        .unwrap();
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == record.id)
    })
    .await
    .expect("loop should recover");

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_wake_on_enqueue_skips_the_wait() {
    let store = MemoryJobStore::new();
    let config = WorkerConfig::default()
        .with_poll_intervals(Duration::from_secs(60), Duration::from_secs(60))
        .with_wake_on_enqueue(true);
    let (manager, _gate) = manager(&store, config);
    let mut events = manager.events();
    manager.init();

    // Let the immediate first poll find nothing.
    sleep(Duration::from_millis(50)).await;

    let record = manager
        .add_job("urgent", NewJob::new("echo", JsonValue::Null))
        .await
        .unwrap();
    wait_for_event(&mut events, Duration::from_secs(5), |e| {
        matches!(e, WorkerEvent::JobCompleted { job_id, .. } if *job_id == record.id)
    })
    .await
    .expect("enqueue should wake the filler");

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stats_are_reported_periodically() {
    let store = MemoryJobStore::new();
    let config = WorkerConfig::default()
        .with_workers(3)
        .with_stats_interval(Duration::from_secs(10));
    let (manager, _gate) = manager(&store, config);
    let mut events = manager.events();
    manager.init();

    let event = wait_for_event(&mut events, Duration::from_secs(15), |e| {
        matches!(e, WorkerEvent::Stats(_))
    })
    .await
    .expect("stats should be reported");
    let WorkerEvent::Stats(stats) = event else {
        unreachable!()
    };
    assert_eq!(stats.total_workers, 3);
    assert_eq!(stats.pending_tasks, 0);

    manager.shutdown(Duration::from_secs(1)).await;
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_init_twice_starts_once() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config());
    let mut events = manager.events();

    manager.init();
    manager.init();
    assert!(manager.is_running());

    sleep(Duration::from_millis(50)).await;
    let started = drain(&mut events)
        .into_iter()
        .filter(|e| *e == WorkerEvent::WorkerStarted)
        .count();
    assert_eq!(started, 1);

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config());
    let mut events = manager.events();
    manager.init();

    assert!(manager.shutdown(Duration::from_secs(1)).await);
    assert!(!manager.is_running());
    assert!(drain(&mut events).contains(&WorkerEvent::WorkerStopped));

    assert!(manager.shutdown(Duration::from_secs(1)).await);

    // No restart after shutdown.
    manager.init();
    assert!(!manager.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_shutdowns_wait_for_the_filler() {
    let store = MemoryJobStore::new();
    store.set_fetch_delay(Some(Duration::from_secs(5)));
    let (manager, _gate) = manager(&store, fast_config());
    let record = manager
        .add_job("late", NewJob::new("echo", json!({"n": 1})))
        .await
        .unwrap();
    manager.init();

    // The filler is now waiting on the slow fetch.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(store.fetch_count(), 1);

    let (first, second) = tokio::join!(
        manager.shutdown(Duration::from_secs(1)),
        manager.shutdown(Duration::from_secs(1))
    );
    assert!(first);
    assert!(second);

    // The record fetched during shutdown ran to completion instead of
    // hitting a closed pool.
    sleep(Duration::from_millis(100)).await;
    assert!(store.get(record.id).await.unwrap().is_none());
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_shutdown_leaves_unfinished_jobs_queued() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config());
    manager.init();

    let record = manager
        .add_job("long", NewJob::new("wait", JsonValue::Null))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while manager.stats().active_tasks == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(!manager.shutdown(Duration::from_millis(20)).await);
    assert_eq!(manager.stats().pending_tasks, 0);

    // Give the settlement task a chance to run.
    sleep(Duration::from_millis(50)).await;
    let kept = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(kept.status, JobStatus::Queued);
    assert_eq!(kept.metadata.retries, 0);
}

#[tokio::test]
async fn test_disabled_manager_only_queues() {
    let store = MemoryJobStore::new();
    let (manager, _gate) = manager(&store, fast_config().with_enabled(false));
    manager.init();
    assert!(!manager.is_running());

    let record = manager
        .add_job("parked", NewJob::new("echo", JsonValue::Null))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(store.fetch_count(), 0);
    assert_eq!(
        store.get(record.id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );
    assert!(manager.shutdown(Duration::from_secs(1)).await);
}
