//! Job manager: the producer-facing entry point that wires store, pool and
//! queue filler together and owns their lifecycle.

use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobmill_core::defaults;
use jobmill_core::{JobRecord, JobStore, NewJob, Result};

use crate::filler::{FillerConfig, QueueFiller};
use crate::handler::HandlerRegistry;
use crate::pool::{PoolStats, WorkerPool};

/// Configuration for the job engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Whether `init` starts the filler and reporter.
    pub enabled: bool,
    /// Number of pool workers.
    pub workers: usize,
    /// Admission ceiling on pool `pending_tasks`.
    pub capacity: usize,
    pub min_poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Idle time before the filler switches to `max_poll_interval`.
    pub increase_interval_threshold: Duration,
    /// Period of the stats reporter.
    pub stats_interval: Duration,
    /// Grace period given to running jobs by the daemon on shutdown.
    pub shutdown_timeout: Duration,
    /// Poll right after `add_job` instead of waiting for the next tick.
    pub wake_on_enqueue: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: defaults::JOB_WORKERS,
            capacity: defaults::JOB_QUEUE_CAPACITY,
            min_poll_interval: Duration::from_millis(defaults::JOB_POLL_MIN_MS),
            max_poll_interval: Duration::from_millis(defaults::JOB_POLL_MAX_MS),
            increase_interval_threshold: Duration::from_millis(
                defaults::JOB_POLL_IDLE_THRESHOLD_MS,
            ),
            stats_interval: Duration::from_millis(defaults::JOB_STATS_INTERVAL_MS),
            shutdown_timeout: Duration::from_millis(defaults::JOB_SHUTDOWN_TIMEOUT_MS),
            wake_on_enqueue: false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key).unwrap_or(default_ms))
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_WORKERS` | `4` | Pool workers |
    /// | `JOB_QUEUE_CAPACITY` | `500` | Admission ceiling on pool backlog |
    /// | `JOB_POLL_MIN_MS` | `1000` | Poll interval while work is found |
    /// | `JOB_POLL_MAX_MS` | `60000` | Poll interval once idle |
    /// | `JOB_POLL_IDLE_THRESHOLD_MS` | `30000` | Idle time before slowing down |
    /// | `JOB_STATS_INTERVAL_MS` | `10000` | Stats report period |
    /// | `JOB_SHUTDOWN_TIMEOUT_MS` | `10000` | Shutdown grace period |
    /// | `JOB_WAKE_ON_ENQUEUE` | `false` | Poll immediately after `add_job` |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let wake_on_enqueue = std::env::var("JOB_WAKE_ON_ENQUEUE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Self {
            enabled,
            workers: env_parse("JOB_WORKERS").unwrap_or(defaults::JOB_WORKERS),
            capacity: env_parse("JOB_QUEUE_CAPACITY").unwrap_or(defaults::JOB_QUEUE_CAPACITY),
            min_poll_interval: env_millis("JOB_POLL_MIN_MS", defaults::JOB_POLL_MIN_MS),
            max_poll_interval: env_millis("JOB_POLL_MAX_MS", defaults::JOB_POLL_MAX_MS),
            increase_interval_threshold: env_millis(
                "JOB_POLL_IDLE_THRESHOLD_MS",
                defaults::JOB_POLL_IDLE_THRESHOLD_MS,
            ),
            stats_interval: env_millis("JOB_STATS_INTERVAL_MS", defaults::JOB_STATS_INTERVAL_MS),
            shutdown_timeout: env_millis(
                "JOB_SHUTDOWN_TIMEOUT_MS",
                defaults::JOB_SHUTDOWN_TIMEOUT_MS,
            ),
            wake_on_enqueue,
        }
        .normalized()
    }

    /// Clamp values into their valid ranges.
    ///
    /// Poll and stats intervals are kept between 1ms and
    /// [`defaults::JOB_POLL_INTERVAL_CEILING_MS`].
    pub fn normalized(mut self) -> Self {
        let floor = Duration::from_millis(1);
        let ceiling = Duration::from_millis(defaults::JOB_POLL_INTERVAL_CEILING_MS);

        self.workers = self.workers.max(1);
        self.capacity = self.capacity.max(1);
        self.min_poll_interval = self.min_poll_interval.clamp(floor, ceiling);
        self.max_poll_interval = self.max_poll_interval.clamp(self.min_poll_interval, ceiling);
        self.increase_interval_threshold = self.increase_interval_threshold.min(ceiling);
        if self.stats_interval.is_zero() {
            self.stats_interval = Duration::from_millis(defaults::JOB_STATS_INTERVAL_MS);
        }
        self.stats_interval = self.stats_interval.min(ceiling);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the min and max poll intervals.
    pub fn with_poll_intervals(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.increase_interval_threshold = threshold;
        self
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_wake_on_enqueue(mut self, wake: bool) -> Self {
        self.wake_on_enqueue = wake;
        self
    }

    /// The subset of settings the queue filler needs.
    pub fn filler_config(&self) -> FillerConfig {
        FillerConfig {
            min_poll_interval: self.min_poll_interval,
            max_poll_interval: self.max_poll_interval,
            increase_interval_threshold: self.increase_interval_threshold,
            capacity: self.capacity,
        }
    }
}

/// Event emitted by the job engine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A record was submitted to the pool.
    JobDispatched {
        job_id: Uuid,
        name: String,
        job_path: String,
    },
    /// A job succeeded and its record was deleted.
    JobCompleted { job_id: Uuid, name: String },
    /// A job failed and its record was marked `error`.
    JobFailed {
        job_id: Uuid,
        name: String,
        error: String,
    },
    /// A poll step could not read the store.
    PollFailed { error: String },
    /// Periodic pool stats.
    Stats(PoolStats),
    /// The queue filler started.
    WorkerStarted,
    /// The queue filler stopped.
    WorkerStopped,
}

struct Running {
    shutdown_tx: mpsc::Sender<()>,
    filler: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer API and lifecycle owner of the job engine.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    config: WorkerConfig,
    events: broadcast::Sender<WorkerEvent>,
    wake: Option<Arc<Notify>>,
    lifecycle: StdMutex<Lifecycle>,
    /// Held for the whole shutdown; set to the drain result once it finishes.
    stopped: Mutex<Option<bool>>,
}

impl JobManager {
    /// Create the manager and start the worker pool.
    ///
    /// Must be called from within a Tokio runtime. Nothing is polled until
    /// [`init`](Self::init).
    pub fn new(store: Arc<dyn JobStore>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        let config = config.normalized();
        let (events, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let pool = Arc::new(WorkerPool::new(config.workers, registry));
        let wake = config.wake_on_enqueue.then(|| Arc::new(Notify::new()));

        Self {
            store,
            pool,
            config,
            events,
            wake,
            lifecycle: StdMutex::new(Lifecycle::Idle),
            stopped: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the queue filler and the stats reporter.
    ///
    /// Calling this more than once, or after shutdown, only logs a warning.
    pub fn init(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => {
                warn!(subsystem = "jobs", component = "manager", "Job manager already initialized");
                return;
            }
            Lifecycle::Stopped => {
                warn!(subsystem = "jobs", component = "manager", "Job manager is shut down, not starting");
                return;
            }
        }

        if !self.config.enabled {
            info!(subsystem = "jobs", component = "manager", "Job worker is disabled, not starting");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let filler = QueueFiller::new(
            self.store.clone(),
            self.pool.clone(),
            self.config.filler_config(),
            self.events.clone(),
        );
        let filler = tokio::spawn(filler.run(shutdown_rx, self.wake.clone()));
        let reporter = tokio::spawn(report_stats(
            self.pool.clone(),
            self.events.clone(),
            self.config.stats_interval,
        ));

        info!(
            subsystem = "jobs",
            component = "manager",
            workers = self.config.workers,
            capacity = self.config.capacity,
            stats_interval_ms = self.config.stats_interval.as_millis() as u64,
            "Job manager initialized"
        );

        *lifecycle = Lifecycle::Running(Running {
            shutdown_tx,
            filler,
            reporter,
        });
    }

    /// Queue a job under `name`.
    ///
    /// Records sharing a name never run concurrently; later ones wait in the
    /// store until the earlier one settles.
    pub async fn add_job(&self, name: &str, job: NewJob) -> Result<JobRecord> {
        let record = self.store.insert(name, job.into()).await?;
        debug!(
            subsystem = "jobs",
            component = "manager",
            op = "add_job",
            job_id = %record.id,
            job_name = %record.name,
            job_path = %record.metadata.job,
            "Job queued"
        );
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(record)
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Running(_))
    }

    /// Stop polling, then give running jobs up to `timeout` before
    /// terminating them.
    ///
    /// Returns `true` if the pool drained in time. Later and overlapping
    /// calls wait for the first one to finish and return its result.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock().await;
        if let Some(drained) = *stopped {
            return drained;
        }

        let previous = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Stopped);

        if let Lifecycle::Running(running) = previous {
            let _ = running.shutdown_tx.send(()).await;
            if let Err(e) = running.filler.await {
                error!(subsystem = "jobs", component = "manager", error = ?e, "Queue filler task failed");
            }
            running.reporter.abort();
        }

        let drained = self.pool.shutdown(timeout).await;
        info!(subsystem = "jobs", component = "manager", drained, "Job manager stopped");
        *stopped = Some(drained);
        drained
    }
}

async fn report_stats(
    pool: Arc<WorkerPool>,
    events: broadcast::Sender<WorkerEvent>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let stats = pool.stats();
        info!(
            subsystem = "jobs",
            component = "manager",
            op = "stats",
            pending_tasks = stats.pending_tasks,
            active_tasks = stats.active_tasks,
            total_workers = stats.total_workers,
            "Worker pool stats"
        );
        let _ = events.send(WorkerEvent::Stats(stats));
    }
}
