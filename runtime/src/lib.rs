//! # EventFlow Runtime
//!
//! Operational building blocks shared by the EventFlow services:
//!
//! - **Retry**: bounded exponential backoff for contended operations
//! - **Metrics**: Prometheus recorder installation and scrape endpoint
//! - **Background**: periodic jobs stopped through a broadcast shutdown channel
//! - **Memory**: in-memory repository backend

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Periodic background jobs
pub mod background;

/// In-memory repository backend
pub mod memory;

pub use background::{BackgroundJob, PeriodicTask, await_shutdown};
pub use memory::InMemoryRepository;
pub use retry::{RetryError, RetryPolicy, retry_with_backoff, retry_with_predicate};
