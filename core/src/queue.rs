//! Queue backend abstraction.
//!
//! The [`JobQueue`] trait is the one contract shared by every backend the dequeue loop can
//! drain:
//!
//! - `InMemoryJobQueue` (in `provisioning-testing`): single process, no crash recovery
//! - `PostgresJobQueue` (in `provisioning-postgres`): durable rows, skip-locked claims,
//!   heartbeat-based recovery of abandoned leases
//! - `RedpandaJobQueue` (in `provisioning-redpanda`): at-least-once broker delivery
//!
//! # Lease lifecycle
//!
//! ```text
//! enqueue ──► pending ──claim──► in flight ──ack──► (removed)
//!                ▲                  │  │
//!                │   lease expired  │  └──fail──► failed (backend policy)
//!                └──────────────────┘
//!                      heartbeat renews the lease
//! ```
//!
//! Claim errors are infrastructure errors: the dequeue loop retries them with backoff and
//! never reports them as job failures. Heartbeat errors are logged and do not abort the
//! running handler.

use crate::task::{ClaimedTask, Lease, QueueStats, Task, TaskId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`JobQueue`] methods.
pub type QueueFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, QueueError>> + Send + 'a>>;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The task could not be recorded. Never silently dropped: the caller compensates.
    #[error("Failed to enqueue task: {0}")]
    Enqueue(String),

    /// Claiming the next task failed.
    #[error("Failed to claim task: {0}")]
    Claim(String),

    /// Renewing a lease failed.
    #[error("Failed to renew lease: {0}")]
    Heartbeat(String),

    /// The lease is unknown, expired, or was reassigned to another worker.
    #[error("Lease not found for task {0}")]
    LeaseNotFound(TaskId),

    /// Acknowledging a finished task failed.
    #[error("Failed to acknowledge task: {0}")]
    Ack(String),

    /// Marking a task failed did not succeed.
    #[error("Failed to mark task failed: {0}")]
    Fail(String),

    /// A task could not be (de)serialized for transport.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The backend is unreachable.
    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Pluggable storage of pending and in-flight tasks.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so one backend, chosen at startup, can be injected into the
/// dequeue loop as `Arc<dyn JobQueue>`.
pub trait JobQueue: Send + Sync {
    /// Short backend name used in logs and metrics labels.
    fn name(&self) -> &'static str;

    /// Record a pending task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Enqueue`] if the task could not be recorded.
    fn enqueue(&self, task: Task) -> QueueFuture<'_, TaskId>;

    /// Claim the next available task under a fresh lease.
    ///
    /// Waits at most one backend-specific poll window and returns `Ok(None)` when no task
    /// became available, so callers can observe shutdown between polls.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Claim`] or [`QueueError::Connection`] on infrastructure
    /// failures.
    fn claim(&self) -> QueueFuture<'_, Option<ClaimedTask>>;

    /// Renew a lease while its handler is running.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseNotFound`] if the lease was lost.
    fn heartbeat<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()>;

    /// Remove a finished task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseNotFound`] if the lease was lost.
    fn ack<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()>;

    /// Mark a task failed, applying the backend's failure policy.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseNotFound`] if the lease was lost.
    fn fail<'a>(&'a self, lease: &'a Lease, reason: &'a str) -> QueueFuture<'a, ()>;

    /// Current queue counters.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Connection`] if the backend is unreachable.
    fn stats(&self) -> QueueFuture<'_, QueueStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_not_found_mentions_task() {
        let id = TaskId::new();
        let error = QueueError::LeaseNotFound(id);
        assert_eq!(error.to_string(), format!("Lease not found for task {id}"));
    }
}
