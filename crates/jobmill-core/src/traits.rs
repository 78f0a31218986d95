//! Persistence contract for the job backlog.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{JobMetadata, JobRecord, JobStatus, JobStatusUpdate};

/// Durable, ordered backlog of job records.
///
/// Implementations are shared between the scheduler and producers, so every
/// method must be safe to call concurrently.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record with status `queued`.
    async fn insert(&self, name: &str, metadata: JobMetadata) -> Result<JobRecord>;

    /// Fetch up to `limit` queued records, oldest first.
    async fn fetch_queued(&self, limit: usize) -> Result<Vec<JobRecord>>;

    /// Overwrite status, finish time and metadata of a record.
    async fn update_status(&self, id: Uuid, update: JobStatusUpdate) -> Result<()>;

    /// Delete a record.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Get a record by id.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Count records with the given status.
    async fn count_by_status(&self, status: JobStatus) -> Result<i64>;
}
