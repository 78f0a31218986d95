//! Job handlers and the registry that resolves job paths to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use jobmill_core::JobRecord;

/// Context provided to job handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Path the handler was resolved from.
    pub job_path: String,
    /// Input data from the job record.
    pub data: JsonValue,
    /// Id of the backing record, when the job came from the store.
    pub job_id: Option<Uuid>,
    /// Name of the backing record, when the job came from the store.
    pub name: Option<String>,
    /// Failed attempts recorded before this run.
    pub retries: u32,
}

impl JobContext {
    /// Create a context for an ad-hoc execution.
    pub fn new(job_path: impl Into<String>, data: JsonValue) -> Self {
        Self {
            job_path: job_path.into(),
            data,
            job_id: None,
            name: None,
            retries: 0,
        }
    }

    /// Create the context for executing a stored record.
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            job_path: record.metadata.job.clone(),
            data: record.metadata.data.clone(),
            job_id: Some(record.id),
            name: Some(record.name.clone()),
            retries: record.metadata.retries,
        }
    }
}

/// A unit of work addressed by a job path.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job path this handler serves.
    fn job_path(&self) -> &str;

    /// Run the job. The error's display text is what gets recorded on the
    /// job record.
    async fn execute(&self, ctx: JobContext) -> anyhow::Result<JsonValue>;
}

/// Handler backed by an async closure.
///
/// ```rust,ignore
/// let handler = FnHandler::new("math.double", |ctx: JobContext| async move {
///     let n = ctx.data.as_i64().unwrap_or_default();
///     Ok::<_, anyhow::Error>(json!(n * 2))
/// });
/// ```
pub struct FnHandler<F> {
    job_path: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(job_path: impl Into<String>, f: F) -> Self {
        Self {
            job_path: job_path.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send + 'static,
{
    fn job_path(&self) -> &str {
        &self.job_path
    }

    async fn execute(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        (self.f)(ctx).await
    }
}

/// Returns its input unchanged.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    fn job_path(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: JobContext) -> anyhow::Result<JsonValue> {
        Ok(ctx.data)
    }
}

/// Does nothing and succeeds.
pub struct NoOpHandler {
    job_path: String,
}

impl NoOpHandler {
    pub fn new(job_path: impl Into<String>) -> Self {
        Self {
            job_path: job_path.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_path(&self) -> &str {
        &self.job_path
    }

    async fn execute(&self, _ctx: JobContext) -> anyhow::Result<JsonValue> {
        Ok(JsonValue::Null)
    }
}

/// Job path → handler lookup, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same path.
    pub fn register<H: JobHandler + 'static>(&mut self, handler: H) {
        let path = handler.job_path().to_string();
        debug!(job_path = %path, "Registered job handler");
        self.handlers.insert(path, Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, job_path: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_path).cloned()
    }

    /// Registered job paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
