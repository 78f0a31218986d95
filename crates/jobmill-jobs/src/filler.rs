//! Queue filler: the scheduling loop that moves queued records into the pool.
//!
//! The filler owns all scheduler state (poll interval, last-found time, and
//! the in-flight name registry). Every poll step runs to completion on the
//! filler's own task before the next one is scheduled. Dispatched jobs settle
//! on separate tasks that write the outcome to the store and then report back
//! over a channel, so only the filler ever touches the registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use jobmill_core::defaults;
use jobmill_core::{JobRecord, JobStore};

use crate::dedup::DedupRegistry;
use crate::handler::JobContext;
use crate::manager::WorkerEvent;
use crate::pool::{ExecutionError, TaskHandle, WorkerPool};

/// Tuning for the poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillerConfig {
    /// Interval used while work keeps showing up.
    pub min_poll_interval: Duration,
    /// Interval used once the queue has been idle for longer than the threshold.
    pub max_poll_interval: Duration,
    /// How long the queue must stay empty before switching to the max interval.
    pub increase_interval_threshold: Duration,
    /// Upper bound on pool backlog the filler fills towards.
    pub capacity: usize,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_millis(defaults::JOB_POLL_MIN_MS),
            max_poll_interval: Duration::from_millis(defaults::JOB_POLL_MAX_MS),
            increase_interval_threshold: Duration::from_millis(
                defaults::JOB_POLL_IDLE_THRESHOLD_MS,
            ),
            capacity: defaults::JOB_QUEUE_CAPACITY,
        }
    }
}

/// Number of records to fetch given the pool backlog, or `None` when the pool
/// is saturated and the fetch should be skipped.
///
/// The `capacity + 1` term means a pool sitting exactly at capacity still
/// gets one record.
pub fn admission_headroom(pending_tasks: usize, capacity: usize) -> Option<usize> {
    if pending_tasks > capacity {
        return None;
    }
    Some(capacity.min(capacity + 1 - pending_tasks))
}

/// Snap-to-bounds poll interval.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    min: Duration,
    max: Duration,
    threshold: Duration,
    current: Duration,
    last_found_at: Instant,
}

impl PollBackoff {
    /// Start at the min interval, counting `now` as the last time work was seen.
    pub fn new(config: &FillerConfig, now: Instant) -> Self {
        Self {
            min: config.min_poll_interval,
            max: config.max_poll_interval,
            threshold: config.increase_interval_threshold,
            current: config.min_poll_interval,
            last_found_at: now,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn last_found_at(&self) -> Instant {
        self.last_found_at
    }

    /// Record the outcome of a fetch and return the interval to wait next.
    pub fn observe(&mut self, found: usize, now: Instant) -> Duration {
        if found > 0 {
            self.last_found_at = now;
            self.current = self.min;
        } else if now.saturating_duration_since(self.last_found_at) > self.threshold {
            self.current = self.max;
        }
        self.current
    }
}

/// Sent by a settlement task once the job outcome is written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub name: String,
    pub job_id: Uuid,
}

/// What a single poll step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    /// Records returned by the store.
    pub fetched: usize,
    /// Records submitted to the pool.
    pub dispatched: usize,
    /// Records left queued because their name was already in flight.
    pub skipped: usize,
    /// The pool was over capacity so nothing was fetched.
    pub saturated: bool,
    /// The store fetch failed.
    pub failed: bool,
}

/// Single-consumer scheduling loop over a [`JobStore`] and a [`WorkerPool`].
pub struct QueueFiller {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    config: FillerConfig,
    backoff: PollBackoff,
    in_flight: DedupRegistry,
    settled_tx: mpsc::UnboundedSender<Settled>,
    settled_rx: mpsc::UnboundedReceiver<Settled>,
    events: broadcast::Sender<WorkerEvent>,
}

impl QueueFiller {
    pub fn new(
        store: Arc<dyn JobStore>,
        pool: Arc<WorkerPool>,
        config: FillerConfig,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        Self {
            backoff: PollBackoff::new(&config, Instant::now()),
            store,
            pool,
            config,
            in_flight: DedupRegistry::new(),
            settled_tx,
            settled_rx,
            events,
        }
    }

    /// Interval the loop will wait after the current step.
    pub fn poll_interval(&self) -> Duration {
        self.backoff.current()
    }

    /// Names currently dispatched and not yet settled.
    pub fn in_flight(&self) -> &DedupRegistry {
        &self.in_flight
    }

    /// Run one poll step: admission check, fetch, backoff, dispatch.
    ///
    /// Store errors are logged and reported; they never propagate.
    pub async fn poll(&mut self) -> PollReport {
        let mut report = PollReport::default();
        let stats = self.pool.stats();

        let Some(want) = admission_headroom(stats.pending_tasks, self.config.capacity) else {
            debug!(
                subsystem = "jobs",
                component = "filler",
                op = "poll",
                pending_tasks = stats.pending_tasks,
                capacity = self.config.capacity,
                "Pool saturated, skipping fetch"
            );
            report.saturated = true;
            return report;
        };

        let records = match self.store.fetch_queued(want).await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "filler",
                    op = "poll",
                    error = %e,
                    "Failed to fetch queued jobs"
                );
                let _ = self.events.send(WorkerEvent::PollFailed {
                    error: e.to_string(),
                });
                report.failed = true;
                return report;
            }
        };

        report.fetched = records.len();
        let interval = self.backoff.observe(records.len(), Instant::now());

        for record in records {
            if self.in_flight.contains(&record.name) {
                trace!(
                    subsystem = "jobs",
                    component = "filler",
                    job_id = %record.id,
                    job_name = %record.name,
                    "Name already in flight, leaving queued"
                );
                report.skipped += 1;
                continue;
            }
            self.dispatch(record);
            report.dispatched += 1;
        }

        debug!(
            subsystem = "jobs",
            component = "filler",
            op = "poll",
            pending_tasks = stats.pending_tasks,
            want,
            fetched = report.fetched,
            dispatched = report.dispatched,
            skipped = report.skipped,
            poll_interval_ms = interval.as_millis() as u64,
            "Poll complete"
        );
        report
    }

    fn dispatch(&mut self, record: JobRecord) {
        self.in_flight.add(&record.name);

        let handle = self.pool.submit(JobContext::from_record(&record));
        let _ = self.events.send(WorkerEvent::JobDispatched {
            job_id: record.id,
            name: record.name.clone(),
            job_path: record.metadata.job.clone(),
        });

        tokio::spawn(settle(
            self.store.clone(),
            self.events.clone(),
            self.settled_tx.clone(),
            record,
            handle,
        ));
    }

    /// Forget a settled job's name so records sharing it can be dispatched.
    pub fn release(&mut self, settled: Settled) {
        if !self.in_flight.remove(&settled.name) {
            warn!(
                subsystem = "jobs",
                component = "filler",
                job_id = %settled.job_id,
                job_name = %settled.name,
                "Settled job was not in flight"
            );
        }
    }

    /// Drive the loop until `shutdown_rx` fires or its sender is dropped.
    ///
    /// The first step runs immediately. `wake`, when given, triggers an early
    /// step; wake-ups arriving during a step coalesce into one.
    pub async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>, wake: Option<Arc<Notify>>) {
        info!(
            subsystem = "jobs",
            component = "filler",
            capacity = self.config.capacity,
            min_poll_interval_ms = self.config.min_poll_interval.as_millis() as u64,
            max_poll_interval_ms = self.config.max_poll_interval.as_millis() as u64,
            wake_on_enqueue = wake.is_some(),
            "Queue filler started"
        );
        let _ = self.events.send(WorkerEvent::WorkerStarted);

        let mut next_poll = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!(subsystem = "jobs", component = "filler", "Queue filler received shutdown signal");
                    break;
                }
                Some(settled) = self.settled_rx.recv() => {
                    self.release(settled);
                }
                _ = sleep_until(next_poll) => {
                    self.poll().await;
                    next_poll = next_deadline(self.backoff.current());
                }
                _ = wait_for_wake(wake.as_deref()) => {
                    trace!(subsystem = "jobs", component = "filler", "Woken by enqueue");
                    self.poll().await;
                    next_poll = next_deadline(self.backoff.current());
                }
            }
        }

        let _ = self.events.send(WorkerEvent::WorkerStopped);
        info!(
            subsystem = "jobs",
            component = "filler",
            in_flight = self.in_flight.len(),
            "Queue filler stopped"
        );
    }
}

/// `now + interval`, capped so an oversized interval cannot overflow the clock.
fn next_deadline(interval: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(interval)
        .or_else(|| now.checked_add(Duration::from_millis(defaults::JOB_POLL_INTERVAL_CEILING_MS)))
        .unwrap_or(now)
}

async fn wait_for_wake(wake: Option<&Notify>) {
    match wake {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

/// Await a dispatched job and write its outcome.
///
/// Success deletes the record; failure marks it `error`. Jobs cut short by
/// pool shutdown stay queued so they run again after restart. The name is
/// released in every case, including when the store write fails.
async fn settle(
    store: Arc<dyn JobStore>,
    events: broadcast::Sender<WorkerEvent>,
    settled_tx: mpsc::UnboundedSender<Settled>,
    record: JobRecord,
    handle: TaskHandle,
) {
    let start = Instant::now();
    let job_id = record.id;

    match handle.await {
        Ok(_) => match store.delete(job_id).await {
            Ok(()) => {
                info!(
                    subsystem = "jobs",
                    component = "filler",
                    op = "settle",
                    job_id = %job_id,
                    job_name = %record.name,
                    job_path = %record.metadata.job,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                let _ = events.send(WorkerEvent::JobCompleted {
                    job_id,
                    name: record.name.clone(),
                });
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "filler",
                    op = "settle",
                    job_id = %job_id,
                    error = %e,
                    "Failed to delete completed job"
                );
            }
        },
        Err(e @ (ExecutionError::Terminated | ExecutionError::PoolClosed)) => {
            debug!(
                subsystem = "jobs",
                component = "filler",
                op = "settle",
                job_id = %job_id,
                reason = %e,
                "Job not run to completion, leaving queued"
            );
        }
        Err(e) => {
            let message = e.to_string();
            warn!(
                subsystem = "jobs",
                component = "filler",
                op = "settle",
                job_id = %job_id,
                job_name = %record.name,
                job_path = %record.metadata.job,
                error = %message,
                duration_ms = start.elapsed().as_millis() as u64,
                "Job failed"
            );
            let update = record.failure_update(message.clone(), Utc::now());
            match store.update_status(job_id, update).await {
                Ok(()) => {
                    let _ = events.send(WorkerEvent::JobFailed {
                        job_id,
                        name: record.name.clone(),
                        error: message,
                    });
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "filler",
                        op = "settle",
                        job_id = %job_id,
                        error = %e,
                        "Failed to record job failure"
                    );
                }
            }
        }
    }

    let _ = settled_tx.send(Settled {
        name: record.name,
        job_id,
    });
}
