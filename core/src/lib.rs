//! # Provisioning Core
//!
//! Core traits and types of the provisioning job orchestration engine.
//!
//! A provisioning request ("reservation") is executed out-of-band as one or more queued
//! jobs. This crate defines the vocabulary every other crate of the workspace shares:
//!
//! - **Reservation model** ([`reservation`], [`pubkey`]): the durable progress record
//!   (`step` / `steps` / `status` / `success` / `error`) and its provider details
//! - **Stores** ([`store`]): tenant-scoped persistence traits with narrow atomic updates
//! - **Tasks and queues** ([`task`], [`queue`]): the queue-resident envelope and the
//!   backend contract (enqueue, claim, heartbeat, ack, fail)
//! - **Registry** ([`registry`]): job type to typed handler mapping
//! - **Job context** ([`context`]): tenant, correlation ids, span and cancellation of one
//!   job execution, and the [`JobError`](context::JobError) handlers return
//! - **Cloud capabilities** ([`clouds`]): the narrow provider interfaces handlers call
//!
//! ## Data flow
//!
//! ```text
//! request handler ──create──► ReservationStore
//!        │
//!        └──enqueue(Task)──► JobQueue ──claim──► Worker ──prepare──► TaskRegistry
//!                                ▲                 │
//!                                └──ack / fail─────┤ invoke(JobContext)
//!                                                  ▼
//!                                      handler ──► StepTracker ──► ReservationStore
//! ```

pub mod clouds;
pub mod context;
pub mod pubkey;
pub mod queue;
pub mod registry;
pub mod reservation;
pub mod store;
pub mod task;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use context::{JobContext, JobError};
pub use queue::{JobQueue, QueueError};
pub use registry::{JobArgs, TaskError, TaskRegistry};
pub use reservation::{AccountId, ReservationId};
pub use store::{AccountStore, PubkeyStore, ReservationStore, StoreError};
pub use task::{ClaimedTask, Lease, QueueStats, Task, TaskId};

/// Injected dependencies shared by the stores and the runtime.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use provisioning_core::environment::{Clock, SystemClock};
    ///
    /// let before = chrono::Utc::now();
    /// assert!(SystemClock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
