//! Queue-resident task envelope and backend-owned delivery metadata.
//!
//! A [`Task`] is what travels through a [`JobQueue`](crate::queue::JobQueue): the job type
//! used as registry key, the JSON-encoded arguments, and the routing identifiers copied out
//! of those arguments so backends can index and log them without decoding the body.
//!
//! Delivery metadata (attempt count, heartbeat deadline, lease token) lives in the
//! [`Lease`] handed out by the backend on claim and never in business code.

use crate::reservation::{AccountId, ReservationId};
use crate::registry::{JobArgs, TaskError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a queued task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of queued work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub id: TaskId,
    /// Registry key of the handler.
    pub job_type: String,
    /// JSON-encoded job arguments.
    pub body: Vec<u8>,
    /// Tenant the job runs for.
    pub account_id: AccountId,
    /// Reservation the job mutates.
    pub reservation_id: ReservationId,
    /// Correlation id of the originating request.
    pub trace_id: Option<String>,
    /// Edge request id of the originating request.
    pub edge_id: Option<String>,
    /// Time the task was created.
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from typed job arguments.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Encode`] if the arguments cannot be serialized.
    pub fn new<A: JobArgs>(args: &A) -> Result<Self, TaskError> {
        let body = serde_json::to_vec(args).map_err(|e| TaskError::Encode {
            job_type: A::JOB_TYPE.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            id: TaskId::new(),
            job_type: A::JOB_TYPE.to_string(),
            body,
            account_id: args.account_id(),
            reservation_id: args.reservation_id(),
            trace_id: None,
            edge_id: None,
            enqueued_at: Utc::now(),
        })
    }

    /// Attach the correlation id of the originating request.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach the edge request id of the originating request.
    #[must_use]
    pub fn with_edge_id(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

/// Time-bounded claim a worker holds on a task.
///
/// The token is opaque to everything but the backend that issued it: a row token for
/// the relational backend, `partition:offset` for the broker backend.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Lease {
    /// Claimed task.
    pub task_id: TaskId,
    /// Backend-specific token identifying this claim.
    pub token: String,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.task_id, self.token, self.attempt)
    }
}

/// A task together with the lease under which it was claimed.
#[derive(Clone, Debug)]
pub struct ClaimedTask {
    /// The task.
    pub task: Task,
    /// Lease to heartbeat, ack or fail with.
    pub lease: Lease,
}

/// Point-in-time queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting to be claimed.
    pub enqueued: u64,
    /// Tasks currently leased by a worker.
    pub in_flight: u64,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Sample {
        account_id: AccountId,
        reservation_id: ReservationId,
        note: String,
    }

    impl JobArgs for Sample {
        const JOB_TYPE: &'static str = "sample";

        fn account_id(&self) -> AccountId {
            self.account_id
        }

        fn reservation_id(&self) -> ReservationId {
            self.reservation_id
        }
    }

    #[test]
    fn task_copies_routing_fields() {
        let args = Sample {
            account_id: AccountId::new(10),
            reservation_id: ReservationId::new(20),
            note: "hello".to_string(),
        };

        let task = Task::new(&args).unwrap().with_trace_id("abc");

        assert_eq!(task.job_type, "sample");
        assert_eq!(task.account_id, AccountId::new(10));
        assert_eq!(task.reservation_id, ReservationId::new(20));
        assert_eq!(task.trace_id.as_deref(), Some("abc"));
        assert!(task.edge_id.is_none());

        let body: serde_json::Value = serde_json::from_slice(&task.body).unwrap();
        assert_eq!(body["note"], "hello");
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }
}
