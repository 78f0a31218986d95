//! PostgreSQL job store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use serde_json::{Map, Value as JsonValue};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, error};
use uuid::Uuid;

use jobmill_core::{
    new_v7, Error, JobMetadata, JobRecord, JobStatus, JobStatusUpdate, JobStore, Result,
};

const RECORD_COLUMNS: &str = "id, name, status, metadata, created_at, updated_at, finished_at";

/// PostgreSQL implementation of [`JobStore`] over the `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record(row: &PgRow) -> Result<JobRecord> {
        let status: String = row.try_get("status")?;
        let Json(metadata): Json<JsonValue> = row.try_get("metadata")?;
        Ok(JobRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            status: status.parse()?,
            metadata: JobMetadata::from_value(metadata)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    /// Move a row that cannot be decoded out of the queue, keeping its raw
    /// metadata and recording why.
    async fn mark_unreadable(&self, row: &PgRow, message: &str) -> Result<()> {
        let id: Uuid = row.try_get("id")?;
        let raw = row
            .try_get::<Json<JsonValue>, _>("metadata")
            .map(|Json(value)| value)
            .unwrap_or(JsonValue::Null);
        let now = Utc::now();

        sqlx::query(
            "UPDATE jobs
             SET status = $2, finished_at = $3, updated_at = $3, metadata = $4
             WHERE id = $1",
        )
        .bind(id)
        .bind(JobStatus::Error.as_str())
        .bind(now)
        .bind(Json(unreadable_metadata(raw, message)))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

/// Stored metadata for a record that could not be decoded: the original
/// object (or the raw value under `data`) plus the decode error.
fn unreadable_metadata(raw: JsonValue, message: &str) -> JsonValue {
    let mut object = match raw {
        JsonValue::Object(object) => object,
        other => {
            let mut object = Map::new();
            object.insert("data".to_string(), other);
            object
        }
    };
    object.insert("error".to_string(), JsonValue::String(message.to_string()));
    JsonValue::Object(object)
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, name: &str, metadata: JobMetadata) -> Result<JobRecord> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO jobs (id, name, status, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(name)
        .bind(JobStatus::Queued.as_str())
        .bind(Json(&metadata))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_record(&row)
    }

    async fn fetch_queued(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM jobs
             WHERE status = $1
             ORDER BY created_at ASC, id ASC
             LIMIT $2"
        ))
        .bind(JobStatus::Queued.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "jobs",
            op = "fetch_queued",
            limit,
            result_count = rows.len(),
            "Fetched queued jobs"
        );

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_record(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let id: Uuid = row.try_get("id")?;
                    error!(
                        subsystem = "database",
                        component = "jobs",
                        op = "fetch_queued",
                        job_id = %id,
                        error = %e,
                        "Unreadable job record, marking as error"
                    );
                    if let Err(mark_err) = self.mark_unreadable(row, &e.to_string()).await {
                        error!(
                            subsystem = "database",
                            component = "jobs",
                            job_id = %id,
                            error = %mark_err,
                            "Failed to mark unreadable job record"
                        );
                    }
                }
            }
        }
        Ok(records)
    }

    async fn update_status(&self, id: Uuid, update: JobStatusUpdate) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = $2, finished_at = $3, metadata = $4, updated_at = $5
             WHERE id = $1",
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.finished_at)
        .bind(Json(&update.metadata))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("SELECT {RECORD_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_record).transpose()
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count)
    }
}
