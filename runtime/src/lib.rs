//! # Provisioning Runtime
//!
//! Execution side of the provisioning job engine.
//!
//! ## Core Components
//!
//! - **Worker**: the dequeue loop draining a [`JobQueue`](provisioning_core::JobQueue)
//!   with a fixed number of parallel loops, heartbeats, deadlines and panic recovery
//! - **Step Tracker**: the before/after status bracket and terminal finalization every
//!   handler goes through
//! - **Retry**: bounded retry with backoff for transient errors
//! - **Metrics**: Prometheus recorders for jobs, reservations, queues and retries
//!
//! ## Example
//!
//! ```ignore
//! use provisioning_runtime::{StepTracker, Worker, WorkerConfig};
//!
//! let worker = Worker::new(queue, registry, StepTracker::new(store), WorkerConfig::default());
//! let handle = worker.start(shutdown.clone());
//!
//! // Later
//! handle.stop().await;
//! ```

/// Retry logic with backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Step orchestration helpers
pub mod steps;

/// Dequeue loop
pub mod worker;

pub use retry::{Backoff, RetryPolicy, retry_with_backoff, retry_with_predicate, wait_and_retry};
pub use steps::{Step, StepTracker};
pub use worker::{MIN_HEARTBEAT_INTERVAL, Worker, WorkerConfig, WorkerHandle};
