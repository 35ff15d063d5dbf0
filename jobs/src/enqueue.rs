//! Request-side helpers: putting typed jobs on a queue and resolving the tenant.

use provisioning_core::pubkey::Account;
use provisioning_core::queue::{JobQueue, QueueError};
use provisioning_core::registry::{JobArgs, TaskError};
use provisioning_core::store::{AccountStore, StoreError};
use provisioning_core::task::{Task, TaskId};
use provisioning_runtime::{Backoff, RetryPolicy, retry_with_predicate};
use std::time::Duration;
use thiserror::Error;

/// Enqueue failures, reported to the caller that asked for the job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// The arguments could not be encoded.
    #[error("unable to enqueue task: {0}")]
    Task(#[from] TaskError),

    /// The queue backend rejected the task.
    #[error("unable to enqueue task: {0}")]
    Queue(#[from] QueueError),
}

/// Correlation identifiers of the request a job is enqueued for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestIds {
    /// Request trace id, copied into the job context.
    pub trace_id: Option<String>,
    /// Edge request id, copied into the job context.
    pub edge_id: Option<String>,
}

impl RequestIds {
    /// Ids of a request carrying a trace id.
    #[must_use]
    pub fn traced(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            edge_id: None,
        }
    }

    /// Attach the edge request id.
    #[must_use]
    pub fn with_edge_id(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

/// Encode `args` into a task and put it on `queue`.
///
/// # Errors
///
/// Returns [`EnqueueError`] when the arguments cannot be encoded or the backend rejects
/// the task.
pub async fn enqueue<A: JobArgs>(
    queue: &dyn JobQueue,
    args: &A,
    ids: &RequestIds,
) -> Result<TaskId, EnqueueError> {
    let mut task = Task::new(args)?;
    if let Some(trace_id) = &ids.trace_id {
        task = task.with_trace_id(trace_id.clone());
    }
    if let Some(edge_id) = &ids.edge_id {
        task = task.with_edge_id(edge_id.clone());
    }

    let task_id = queue.enqueue(task).await?;
    tracing::debug!(
        task_id = %task_id,
        job_type = A::JOB_TYPE,
        reservation_id = %args.reservation_id(),
        queue = queue.name(),
        "Added job task"
    );
    Ok(task_id)
}

fn account_retry_policy() -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(3)
        .backoff(Backoff::Linear)
        .unit(Duration::from_millis(20))
        .max_delay(Duration::from_millis(100))
        .build()
}

/// Resolve the tenant of an organization, creating it on first use.
///
/// Two requests of a new organization can race on the first insert; the loser sees a
/// unique violation and retries, which then finds the winner's row.
///
/// # Errors
///
/// Returns the store error once retries are exhausted or when it is not transient.
pub async fn get_or_create_account(
    store: &dyn AccountStore,
    org_id: &str,
    account_number: Option<&str>,
) -> Result<Account, StoreError> {
    retry_with_predicate(
        account_retry_policy(),
        || store.get_or_create(org_id.to_string(), account_number.map(str::to_string)),
        StoreError::is_transient,
    )
    .await
}
