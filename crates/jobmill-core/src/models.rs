//! Job record model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::error::Error;

/// Persisted status of a job record.
///
/// There is no running or done status: a record is `Queued` until it either
/// succeeds (and is deleted) or fails (and moves to `Error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "error" => Ok(JobStatus::Error),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }
}

/// Structured payload stored alongside a job record.
///
/// Keys other than the four known ones are kept in `extra` and written back
/// unchanged on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Path of the handler that runs this job.
    pub job: String,
    /// Input handed to the handler.
    #[serde(default)]
    pub data: JsonValue,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retries: u32,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl JobMetadata {
    /// Metadata for a freshly queued job.
    pub fn new(job: impl Into<String>, data: JsonValue) -> Self {
        Self {
            job: job.into(),
            data,
            retries: 0,
            error: None,
            extra: Map::new(),
        }
    }

    /// Decode stored metadata. Fails with [`Error::Serialization`] when the
    /// value does not have the expected shape.
    pub fn from_value(value: JsonValue) -> Result<Self, Error> {
        Ok(serde_json::from_value(value)?)
    }

    /// Copy of this metadata with one more failed attempt recorded.
    pub fn with_failure(&self, message: impl Into<String>) -> Self {
        Self {
            retries: self.retries.saturating_add(1),
            error: Some(message.into()),
            ..self.clone()
        }
    }
}

/// Producer-supplied description of a job to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl NewJob {
    pub fn new(job: impl Into<String>, data: JsonValue) -> Self {
        Self {
            job: job.into(),
            data,
        }
    }
}

impl From<NewJob> for JobMetadata {
    fn from(job: NewJob) -> Self {
        JobMetadata::new(job.job, job.data)
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Dedup key: at most one record per name is in flight at a time.
    pub name: String,
    pub status: JobStatus,
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the record moves to `Error`.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// The update that records a failed execution of this job.
    pub fn failure_update(&self, message: impl Into<String>, now: DateTime<Utc>) -> JobStatusUpdate {
        JobStatusUpdate {
            status: JobStatus::Error,
            finished_at: Some(now),
            metadata: self.metadata.with_failure(message),
        }
    }
}

/// New status, finish time and metadata written by [`JobStore::update_status`].
///
/// [`JobStore::update_status`]: crate::traits::JobStore::update_status
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub finished_at: Option<DateTime<Utc>>,
    pub metadata: JobMetadata,
}
