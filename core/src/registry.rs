//! Job type registry.
//!
//! A [`TaskRegistry`] maps job type strings to typed handlers. It is an explicit value
//! built once at startup and handed to the dequeue loop, so tests can run with isolated
//! registries.
//!
//! # Example
//!
//! ```
//! use provisioning_core::registry::{JobArgs, TaskRegistry};
//! use provisioning_core::reservation::{AccountId, ReservationId};
//! use provisioning_core::task::Task;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct PingArgs {
//!     account_id: AccountId,
//!     reservation_id: ReservationId,
//! }
//!
//! impl JobArgs for PingArgs {
//!     const JOB_TYPE: &'static str = "ping";
//!     fn account_id(&self) -> AccountId { self.account_id }
//!     fn reservation_id(&self) -> ReservationId { self.reservation_id }
//! }
//!
//! let mut registry = TaskRegistry::new();
//! registry.register::<PingArgs, _, _>(|_ctx, _args| async { Ok(()) });
//!
//! let args = PingArgs { account_id: AccountId::new(1), reservation_id: ReservationId::new(7) };
//! let task = Task::new(&args).unwrap();
//! let job = registry.prepare(&task).unwrap();
//! assert_eq!(job.reservation_id(), ReservationId::new(7));
//! ```

use crate::context::{JobContext, JobError};
use crate::reservation::{AccountId, ReservationId};
use crate::task::Task;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while encoding, resolving or decoding tasks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No handler is registered for the job type.
    #[error("unknown job type: {0}")]
    UnknownJobType(String),

    /// The payload does not match the requested argument type.
    #[error("cannot decode {job_type} task: {reason}")]
    Decode {
        /// Job type stored in the task.
        job_type: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The arguments could not be serialized.
    #[error("cannot encode {job_type} task: {reason}")]
    Encode {
        /// Job type being encoded.
        job_type: String,
        /// Why encoding failed.
        reason: String,
    },
}

/// Typed arguments of a job type.
///
/// The tenant and reservation are read from the arguments, never inferred, and copied
/// into the task envelope on enqueue.
pub trait JobArgs: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Registry key.
    const JOB_TYPE: &'static str;

    /// Tenant the job runs for.
    fn account_id(&self) -> AccountId;

    /// Reservation the job mutates.
    fn reservation_id(&self) -> ReservationId;
}

type Invoke = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, Result<(), JobError>> + Send>;

type Prepare = Arc<dyn Fn(&Task) -> Result<DecodedJob, TaskError> + Send + Sync>;

/// A decoded task, ready to be invoked once with its context.
pub struct DecodedJob {
    account_id: AccountId,
    reservation_id: ReservationId,
    invoke: Invoke,
}

impl DecodedJob {
    /// Tenant read from the decoded arguments.
    #[must_use]
    pub const fn account_id(&self) -> AccountId {
        self.account_id
    }

    /// Reservation read from the decoded arguments.
    #[must_use]
    pub const fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }

    /// Run the handler.
    pub fn invoke(self, ctx: JobContext) -> BoxFuture<'static, Result<(), JobError>> {
        (self.invoke)(ctx)
    }
}

impl fmt::Debug for DecodedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedJob")
            .field("account_id", &self.account_id)
            .field("reservation_id", &self.reservation_id)
            .finish_non_exhaustive()
    }
}

/// Registry of job handlers keyed by job type.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Prepare>,
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `A::JOB_TYPE`.
    ///
    /// Registering a job type twice replaces the previous handler.
    pub fn register<A, F, Fut>(&mut self, handler: F) -> &mut Self
    where
        A: JobArgs,
        F: Fn(JobContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let prepare: Prepare = Arc::new(move |task: &Task| {
            let args = Self::decode::<A>(task)?;
            let account_id = args.account_id();
            let reservation_id = args.reservation_id();
            let handler = Arc::clone(&handler);
            let invoke: Invoke = Box::new(
                move |ctx: JobContext| -> BoxFuture<'static, Result<(), JobError>> {
                    Box::pin(handler(ctx, args))
                },
            );
            Ok(DecodedJob {
                account_id,
                reservation_id,
                invoke,
            })
        });

        if self.handlers.insert(A::JOB_TYPE, prepare).is_some() {
            tracing::warn!(job_type = A::JOB_TYPE, "Job type registered twice, replacing handler");
        } else {
            tracing::debug!(job_type = A::JOB_TYPE, "Registered job type");
        }
        self
    }

    /// Decode the arguments of `task` as `A`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Decode`] if the task has another job type or the payload does
    /// not deserialize into `A`.
    pub fn decode<A: JobArgs>(task: &Task) -> Result<A, TaskError> {
        if task.job_type != A::JOB_TYPE {
            return Err(TaskError::Decode {
                job_type: task.job_type.clone(),
                reason: format!("expected job type {}", A::JOB_TYPE),
            });
        }

        serde_json::from_slice(&task.body).map_err(|e| TaskError::Decode {
            job_type: task.job_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolve the handler of `task` and decode its arguments.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::UnknownJobType`] if no handler is registered, or
    /// [`TaskError::Decode`] if the payload is malformed.
    pub fn prepare(&self, task: &Task) -> Result<DecodedJob, TaskError> {
        let prepare = self
            .handlers
            .get(task.job_type.as_str())
            .ok_or_else(|| TaskError::UnknownJobType(task.job_type.clone()))?;
        prepare(task)
    }

    /// Whether a handler is registered for `job_type`.
    #[must_use]
    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    #[must_use]
    pub fn job_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Number of registered job types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no job type is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
