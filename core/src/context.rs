//! Per-job execution context and the error type handlers return.
//!
//! A [`JobContext`] is an explicit, request-scoped parameter threaded through every handler
//! and orchestration call. It carries:
//!
//! - the tenant ([`AccountId`]) and reservation the job works on, read from the decoded
//!   job arguments, so no job can run without a tenant
//! - correlation identifiers (`trace_id`, `edge_id`) copied from the originating request
//! - the `job` tracing span, already enriched with those fields
//! - a [`CancellationToken`] and a deadline
//!
//! # Cancellation
//!
//! The dequeue loop cancels the token when the job deadline passes or the worker shuts
//! down. Handlers are never force-killed: they must observe cancellation at their next
//! suspension point, either by sleeping through [`JobContext::sleep`] or by calling
//! [`JobContext::checkpoint`] between units of work.

use crate::clouds::ClientError;
use crate::registry::TaskError;
use crate::reservation::{AccountId, ReservationId};
use crate::store::StoreError;
use crate::task::TaskId;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// Error returned by job handlers.
///
/// The `Display` output is exactly the text stored in the reservation's `error` column.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The handler failed with a message.
    #[error("{0}")]
    Failed(String),

    /// A transient failure the retry helper may try again.
    #[error("{0}")]
    Transient(String),

    /// The job deadline passed.
    #[error("context timeout: deadline exceeded")]
    Timeout,

    /// The worker is shutting down.
    #[error("context canceled: worker shutting down")]
    Shutdown,

    /// The handler panicked.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// A store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A cloud collaborator call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The task could not be decoded.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl JobError {
    /// Handler failure with a message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Prefix the error with what was being attempted, keeping the variant class.
    ///
    /// ```
    /// use provisioning_core::context::JobError;
    ///
    /// let error = JobError::failed("no rows").context("cannot get pubkey by id");
    /// assert_eq!(error.to_string(), "cannot get pubkey by id: no rows");
    /// ```
    #[must_use]
    pub fn context(self, what: &str) -> Self {
        match self {
            Self::Timeout | Self::Shutdown | Self::Panicked(_) => self,
            Self::Transient(message) => Self::Transient(format!("{what}: {message}")),
            other if other.is_transient() => Self::Transient(format!("{what}: {other}")),
            other => Self::Failed(format!("{what}: {other}")),
        }
    }

    /// Whether the error belongs to the "transient, try again" class.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Store(e) => e.is_transient(),
            Self::Client(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the error is the result of context cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Timeout | Self::Shutdown)
    }
}

/// Request-scoped context of one job execution.
#[derive(Clone, Debug)]
pub struct JobContext {
    account_id: AccountId,
    reservation_id: ReservationId,
    job_id: TaskId,
    job_type: String,
    trace_id: String,
    edge_id: Option<String>,
    token: CancellationToken,
    deadline: Instant,
    span: Span,
}

impl JobContext {
    /// New context for a job on `reservation_id` expiring after `timeout`.
    ///
    /// The context starts with a random job id, a fresh trace id, its own cancellation
    /// token and the current span. The dequeue loop overrides these with the builder
    /// methods.
    #[must_use]
    pub fn new(account_id: AccountId, reservation_id: ReservationId, timeout: Duration) -> Self {
        Self {
            account_id,
            reservation_id,
            job_id: TaskId::new(),
            job_type: String::new(),
            trace_id: Uuid::new_v4().to_string(),
            edge_id: None,
            token: CancellationToken::new(),
            deadline: Instant::now() + timeout,
            span: Span::current(),
        }
    }

    /// Set the task identity.
    #[must_use]
    pub fn with_job(mut self, job_id: TaskId, job_type: impl Into<String>) -> Self {
        self.job_id = job_id;
        self.job_type = job_type.into();
        self
    }

    /// Copy the trace id of the originating request, keeping the generated one if absent.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        if let Some(trace_id) = trace_id.filter(|t| !t.is_empty()) {
            self.trace_id = trace_id;
        }
        self
    }

    /// Copy the edge request id of the originating request.
    #[must_use]
    pub fn with_edge_id(mut self, edge_id: Option<String>) -> Self {
        self.edge_id = edge_id;
        self
    }

    /// Use `token` for cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Attach the job span.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Tenant the job runs for.
    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Reservation the job works on.
    #[must_use]
    pub const fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    /// Identifier of the task being executed.
    #[must_use]
    pub const fn job_id(&self) -> TaskId {
        self.job_id
    }

    /// Registry key of the task being executed.
    #[must_use]
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Correlation id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Edge request id, if the request carried one.
    #[must_use]
    pub fn edge_id(&self) -> Option<&str> {
        self.edge_id.as_deref()
    }

    /// Span every log line of the job belongs to.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Cancellation token of the job.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Point in time the job must be done by.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Whether the job was asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.is_timed_out()
    }

    /// Error describing why the context was cancelled.
    #[must_use]
    pub fn cancel_error(&self) -> JobError {
        if self.is_timed_out() {
            JobError::Timeout
        } else {
            JobError::Shutdown
        }
    }

    /// Return an error if the job was asked to stop.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Timeout`] after the deadline, [`JobError::Shutdown`] when the
    /// worker is stopping.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(self.cancel_error())
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless the job is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns the cancellation error if the token fires or the deadline passes during the
    /// sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        self.checkpoint()?;
        tokio::select! {
            () = self.token.cancelled() => Err(self.cancel_error()),
            () = tokio::time::sleep_until(self.deadline) => Err(JobError::Timeout),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Wait until the job is cancelled.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.token.cancelled() => {}
            () = tokio::time::sleep_until(self.deadline) => {}
        }
    }
}
