//! Centralized default constants for jobmill.
//!
//! Every crate and the worker daemon read their defaults from here rather than
//! defining their own magic numbers.

// =============================================================================
// QUEUE FILLER
// =============================================================================

/// Poll interval used while work keeps turning up (milliseconds).
pub const JOB_POLL_MIN_MS: u64 = 1_000;

/// Poll interval once the backlog has been idle for a while (milliseconds).
pub const JOB_POLL_MAX_MS: u64 = 60_000;

/// How long the backlog must stay empty before the filler drops to the
/// slow interval (milliseconds).
pub const JOB_POLL_IDLE_THRESHOLD_MS: u64 = 30_000;

/// Longest poll or stats interval accepted from configuration (milliseconds).
pub const JOB_POLL_INTERVAL_CEILING_MS: u64 = 86_400_000;

/// Admission ceiling on pool `pending_tasks`; also the largest batch a single
/// poll step fetches.
pub const JOB_QUEUE_CAPACITY: usize = 500;

// =============================================================================
// WORKER POOL
// =============================================================================

/// Default number of pool workers.
pub const JOB_WORKERS: usize = 4;

/// Default grace period for in-flight jobs on shutdown (milliseconds).
pub const JOB_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// OBSERVABILITY
// =============================================================================

/// Interval between periodic pool stats reports (milliseconds).
pub const JOB_STATS_INTERVAL_MS: u64 = 10_000;

/// Broadcast channel capacity for worker events.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Connections the Postgres store may hold open.
pub const DB_MAX_CONNECTIONS: u32 = 5;

/// Connections kept warm.
pub const DB_MIN_CONNECTIONS: u32 = 1;

/// Connection acquire timeout (seconds).
pub const DB_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Idle connection lifetime (seconds).
pub const DB_IDLE_TIMEOUT_SECS: u64 = 600;
