//! # jobmill-jobs
//!
//! Background job execution for jobmill.
//!
//! This crate provides:
//! - A fixed-size worker pool that runs handlers resolved by job path
//! - The queue filler, which polls the store with load-adaptive backoff and
//!   admission control
//! - Per-name dedup so records sharing a name never run concurrently
//! - Lifecycle events via broadcast channels
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jobmill_jobs::{EchoHandler, HandlerRegistry, JobManager, NewJob, WorkerConfig};
//! use jobmill_db::Database;
//!
//! let db = Database::connect("postgres://...").await?;
//! let registry = HandlerRegistry::new().with_handler(EchoHandler);
//!
//! let manager = JobManager::new(Arc::new(db.jobs.clone()), registry, WorkerConfig::from_env());
//! manager.init();
//!
//! manager
//!     .add_job("greeting", NewJob::new("echo", serde_json::json!({"hello": "world"})))
//!     .await?;
//!
//! let mut events = manager.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//!
//! manager.shutdown(std::time::Duration::from_secs(10)).await;
//! ```

pub mod dedup;
pub mod filler;
pub mod handler;
pub mod manager;
pub mod pool;

// Re-export core types
pub use jobmill_core::*;

pub use dedup::DedupRegistry;
pub use filler::{admission_headroom, FillerConfig, PollBackoff, PollReport, QueueFiller, Settled};
pub use handler::{EchoHandler, FnHandler, HandlerRegistry, JobContext, JobHandler, NoOpHandler};
pub use manager::{JobManager, WorkerConfig, WorkerEvent};
pub use pool::{ExecutionError, PoolStats, TaskHandle, WorkerPool};
