//! In-memory job store.
//!
//! Keeps the backlog in insertion order behind a `tokio` `RwLock`. Used by the
//! test suites and by embedded deployments that do not need durability.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use jobmill_core::{
    new_v7, Error, JobMetadata, JobRecord, JobStatus, JobStatusUpdate, JobStore, Result,
};

#[derive(Default)]
struct Backlog {
    /// Records keyed by insertion sequence, so iteration is FIFO.
    records: BTreeMap<u64, JobRecord>,
    index: HashMap<Uuid, u64>,
}

/// Store instrumentation and fault injection.
#[derive(Default)]
struct FetchProbe {
    failures_pending: AtomicUsize,
    delete_failures_pending: AtomicUsize,
    update_failures_pending: AtomicUsize,
    in_progress: AtomicUsize,
    peak_in_progress: AtomicUsize,
    total: AtomicUsize,
    delay: StdMutex<Option<Duration>>,
}

/// [`JobStore`] held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    backlog: Arc<RwLock<Backlog>>,
    next_seq: Arc<AtomicU64>,
    probe: Arc<FetchProbe>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `fetch_queued` fail with a store error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.probe.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `delete` fail with a store error.
    pub fn fail_next_deletes(&self, n: usize) {
        self.probe.delete_failures_pending.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `update_status` fail with a store error.
    pub fn fail_next_updates(&self, n: usize) {
        self.probe.update_failures_pending.store(n, Ordering::SeqCst);
    }

    /// Delay every `fetch_queued` by `delay` (on the tokio clock).
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.probe.delay.lock() {
            *slot = delay;
        }
    }

    /// Total number of `fetch_queued` calls so far.
    pub fn fetch_count(&self) -> usize {
        self.probe.total.load(Ordering::SeqCst)
    }

    /// Highest number of `fetch_queued` calls that ever overlapped.
    pub fn peak_concurrent_fetches(&self) -> usize {
        self.probe.peak_in_progress.load(Ordering::SeqCst)
    }

    /// Number of records currently stored, in any status.
    pub async fn len(&self) -> usize {
        self.backlog.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn fetch_delay(&self) -> Option<Duration> {
        self.probe.delay.lock().ok().and_then(|slot| *slot)
    }
}

/// Consume one pending injected failure, if any.
fn take_injected(pending: &AtomicUsize) -> bool {
    pending
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Decrements the in-progress fetch count when a fetch ends, including on
/// early return.
struct InProgress<'a>(&'a FetchProbe);

impl<'a> InProgress<'a> {
    fn enter(probe: &'a FetchProbe) -> Self {
        probe.total.fetch_add(1, Ordering::SeqCst);
        let now = probe.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        probe.peak_in_progress.fetch_max(now, Ordering::SeqCst);
        Self(probe)
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.in_progress.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, name: &str, metadata: JobMetadata) -> Result<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            id: new_v7(),
            name: name.to_string(),
            status: JobStatus::Queued,
            metadata,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let mut backlog = self.backlog.write().await;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        backlog.index.insert(record.id, seq);
        backlog.records.insert(seq, record.clone());

        Ok(record)
    }

    async fn fetch_queued(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let _guard = InProgress::enter(&self.probe);

        if let Some(delay) = self.fetch_delay() {
            tokio::time::sleep(delay).await;
        }
        if take_injected(&self.probe.failures_pending) {
            return Err(Error::Internal("injected fetch failure".to_string()));
        }

        let backlog = self.backlog.read().await;
        Ok(backlog
            .records
            .values()
            .filter(|r| r.status == JobStatus::Queued)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status(&self, id: Uuid, update: JobStatusUpdate) -> Result<()> {
        if take_injected(&self.probe.update_failures_pending) {
            return Err(Error::Internal("injected update failure".to_string()));
        }
        let mut backlog = self.backlog.write().await;
        let seq = *backlog.index.get(&id).ok_or(Error::JobNotFound(id))?;
        let record = backlog
            .records
            .get_mut(&seq)
            .ok_or(Error::JobNotFound(id))?;

        record.status = update.status;
        record.finished_at = update.finished_at;
        record.metadata = update.metadata;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if take_injected(&self.probe.delete_failures_pending) {
            return Err(Error::Internal("injected delete failure".to_string()));
        }
        let mut backlog = self.backlog.write().await;
        let seq = backlog.index.remove(&id).ok_or(Error::JobNotFound(id))?;
        backlog.records.remove(&seq);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let backlog = self.backlog.read().await;
        Ok(backlog
            .index
            .get(&id)
            .and_then(|seq| backlog.records.get(seq))
            .cloned())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let backlog = self.backlog.read().await;
        Ok(backlog
            .records
            .values()
            .filter(|r| r.status == status)
            .count() as i64)
    }
}
