//! # jobmill-core
//!
//! Core types, traits, and abstractions for the jobmill background job engine.
//!
//! This crate provides the job record model, the [`JobStore`] persistence
//! contract, the shared error type and the default tuning constants that the
//! store and scheduler crates build on.
//!
//! ## Logging conventions
//!
//! All crates log through `tracing` with the structured fields `subsystem`
//! (`"jobs"`, `"database"`), `component` (`"filler"`, `"pool"`, `"manager"`,
//! `"jobs"`), `op`, `job_id`, `job_name`, `job_path` and `duration_ms`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Store failures, requires operator attention |
//! | WARN  | Job failures, recoverable issues |
//! | INFO  | Lifecycle events (startup, shutdown), periodic stats |
//! | DEBUG | Poll decisions, dispatch and settlement |
//! | TRACE | Per-record iteration (dedup skips) |

pub mod defaults;
pub mod error;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
pub use uuid_utils::new_v7;
