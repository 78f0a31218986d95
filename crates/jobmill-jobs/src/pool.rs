//! Fixed-size worker pool that executes handlers resolved by job path.
//!
//! Tasks are queued on an unbounded channel shared by `N` worker tasks. Each
//! worker runs one handler at a time; a handler that errors or panics only
//! rejects its own [`TaskHandle`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::handler::{HandlerRegistry, JobContext};

/// Why a pool execution did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),
    /// The handler panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// No handler is registered for the job path.
    #[error("no handler registered for job path '{0}'")]
    UnknownJob(String),
    /// The pool no longer accepts work.
    #[error("worker pool is shut down")]
    PoolClosed,
    /// The pool was shut down before the job finished.
    #[error("job terminated by worker pool shutdown")]
    Terminated,
}

/// Point-in-time pool load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Tasks accepted and not yet settled (queued + executing).
    pub pending_tasks: usize,
    /// Tasks currently executing.
    pub active_tasks: usize,
    /// Number of workers.
    pub total_workers: usize,
}

type Reply = Result<JsonValue, ExecutionError>;

/// Resolves once the submitted job settles.
#[must_use = "dropping a TaskHandle discards the job outcome"]
pub struct TaskHandle {
    rx: oneshot::Receiver<Reply>,
}

impl Future for TaskHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(ExecutionError::Terminated)))
    }
}

#[derive(Default)]
struct Counters {
    pending: AtomicUsize,
    active: AtomicUsize,
}

/// Counts a task as pending for as long as it is alive.
struct PendingSlot(Arc<Counters>);

impl PendingSlot {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.pending.fetch_add(1, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ActiveSlot<'a>(&'a Counters);

impl<'a> ActiveSlot<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Task {
    ctx: JobContext,
    reply: oneshot::Sender<Reply>,
    pending: PendingSlot,
}

/// Fixed set of workers running job handlers.
pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: StdMutex<Option<JoinSet<()>>>,
    /// Held for the whole shutdown; set to the drain result once it finishes.
    stopped: Mutex<Option<bool>>,
    counters: Arc<Counters>,
    total_workers: usize,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerPool {
    /// Start `workers` workers (at least one) serving `registry`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(workers: usize, registry: HandlerRegistry) -> Self {
        let total_workers = workers.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let registry = Arc::new(registry);
        let counters = Arc::new(Counters::default());

        let mut set = JoinSet::new();
        for worker_id in 0..total_workers {
            set.spawn(run_worker(
                worker_id,
                receiver.clone(),
                registry.clone(),
                counters.clone(),
            ));
        }

        info!(
            subsystem = "jobs",
            component = "pool",
            total_workers,
            handlers = registry.len(),
            "Worker pool started"
        );

        Self {
            sender: StdMutex::new(Some(sender)),
            workers: StdMutex::new(Some(set)),
            stopped: Mutex::new(None),
            counters,
            total_workers,
        }
    }

    /// Run the handler registered for `job_path` with `data`.
    pub fn execute(&self, job_path: &str, data: JsonValue) -> TaskHandle {
        self.submit(JobContext::new(job_path, data))
    }

    /// Queue a job with a full context.
    pub fn submit(&self, ctx: JobContext) -> TaskHandle {
        let (reply, rx) = oneshot::channel();
        let sender = lock(&self.sender);

        match sender.as_ref() {
            Some(sender) => {
                let task = Task {
                    ctx,
                    reply,
                    pending: PendingSlot::enter(&self.counters),
                };
                if let Err(mpsc::error::SendError(task)) = sender.send(task) {
                    let _ = task.reply.send(Err(ExecutionError::PoolClosed));
                }
            }
            None => {
                let _ = reply.send(Err(ExecutionError::PoolClosed));
            }
        }

        TaskHandle { rx }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pending_tasks: self.counters.pending.load(Ordering::SeqCst),
            active_tasks: self.counters.active.load(Ordering::SeqCst),
            total_workers: self.total_workers,
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sender).is_none()
    }

    /// Stop accepting work, let workers drain for up to `timeout`, then abort
    /// whatever is still running.
    ///
    /// Returns `true` if the workers drained within the timeout. Later and
    /// overlapping calls wait for the first one to finish and return its
    /// result.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock().await;
        if let Some(drained) = *stopped {
            debug!(subsystem = "jobs", component = "pool", "Worker pool already shut down");
            return drained;
        }

        let drained = self.close_and_drain(timeout).await;
        *stopped = Some(drained);
        drained
    }

    async fn close_and_drain(&self, timeout: Duration) -> bool {
        drop(lock(&self.sender).take());

        let workers = lock(&self.workers).take();
        let Some(mut workers) = workers else {
            return true;
        };

        let start = Instant::now();
        let stats = self.stats();
        info!(
            subsystem = "jobs",
            component = "pool",
            pending_tasks = stats.pending_tasks,
            active_tasks = stats.active_tasks,
            timeout_ms = timeout.as_millis() as u64,
            "Worker pool shutting down"
        );

        let drain = async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    error!(subsystem = "jobs", component = "pool", error = ?e, "Worker task failed");
                }
            }
        };
        let drained = tokio::time::timeout(timeout, drain).await.is_ok();

        if !drained {
            warn!(
                subsystem = "jobs",
                component = "pool",
                active_tasks = self.counters.active.load(Ordering::SeqCst),
                "Shutdown timeout elapsed, terminating workers"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        info!(
            subsystem = "jobs",
            component = "pool",
            drained,
            duration_ms = start.elapsed().as_millis() as u64,
            "Worker pool stopped"
        );
        drained
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<Counters>,
) {
    loop {
        let task = receiver.lock().await.recv().await;
        let Some(Task {
            ctx,
            reply,
            pending,
        }) = task
        else {
            break;
        };

        let active = ActiveSlot::enter(&counters);
        let outcome = run_handler(&registry, ctx).await;
        drop(active);
        drop(pending);

        let _ = reply.send(outcome);
    }
    debug!(subsystem = "jobs", component = "pool", worker_id, "Worker exited");
}

async fn run_handler(registry: &HandlerRegistry, ctx: JobContext) -> Reply {
    let Some(handler) = registry.get(&ctx.job_path) else {
        return Err(ExecutionError::UnknownJob(ctx.job_path));
    };

    match AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(ExecutionError::Failed(format!("{e:#}"))),
        Err(panic) => Err(ExecutionError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
