//! Step orchestration: the before/after bracket around every unit of provider work.
//!
//! Every handler follows the same shape:
//!
//! ```text
//! update_status_before("Launching instance(s)")
//!     ... provider work ...
//! update_status_after("Launched instance(s)", 1)   // on success, error and panic
//! finish_step(result)
//! ```
//!
//! [`StepTracker::run_step`] packages the bracket so the "after" update cannot be
//! forgotten on any exit path. Multi-step handlers call [`StepTracker::finish_step`] after
//! each sub-step: a failure in a later sub-step then leaves the completed count of the
//! earlier ones visible, and only the sub-step that completes the counter may flip
//! `success` to true.
//!
//! Store errors inside these helpers are logged and never replace the handler's own
//! result: the reservation row is an observability surface, the task outcome is what the
//! queue acts on.

use crate::metrics::ReservationMetrics;
use futures::FutureExt;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::reservation::{STATUS_TIMEOUT, StatusUpdate};
use provisioning_core::store::ReservationStore;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// One bracketed unit of reservation progress.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    /// Idempotency key, unique among the steps of one reservation.
    pub key: String,
    /// Status written before the work starts.
    pub before: String,
    /// Status written after the work ends.
    pub after: String,
    /// Steps completed by this unit.
    pub add_steps: i32,
}

impl Step {
    /// Step completing one unit of progress.
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        before: impl Into<String>,
        after: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            before: before.into(),
            after: after.into(),
            add_steps: 1,
        }
    }

    /// Override the number of completed steps.
    #[must_use]
    pub const fn with_add_steps(mut self, add_steps: i32) -> Self {
        self.add_steps = add_steps;
        self
    }
}

/// Applies step transitions and terminal outcomes to reservations.
#[derive(Clone)]
pub struct StepTracker {
    store: Arc<dyn ReservationStore>,
}

impl StepTracker {
    /// Tracker writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    /// Write the status marking the start of a unit of work.
    pub async fn update_status_before(&self, ctx: &JobContext, status: &str) {
        self.apply(ctx, StatusUpdate::status(status)).await;
    }

    /// Write the status marking the end of a unit of work and count it as done.
    ///
    /// When the job has run past its deadline the status is forced to `"Timeout"`.
    pub async fn update_status_after(
        &self,
        ctx: &JobContext,
        status: &str,
        add_steps: i32,
        step_key: Option<&str>,
    ) {
        let status = if ctx.is_timed_out() {
            STATUS_TIMEOUT
        } else {
            status
        };
        let update = StatusUpdate {
            status: status.to_string(),
            add_steps,
            step_key: step_key.map(str::to_string),
        };
        self.apply(ctx, update).await;
    }

    async fn apply(&self, ctx: &JobContext, update: StatusUpdate) {
        let status = update.status.clone();
        let add_steps = update.add_steps;
        match self
            .store
            .update_status(ctx.account_id(), ctx.reservation_id(), update)
            .await
        {
            Ok(()) => {
                tracing::debug!(status = %status, "Reservation status updated");
                if add_steps > 0 {
                    tracing::trace!(add_steps, "Reservation step counter advanced");
                }
            }
            Err(e) => {
                tracing::error!(status = %status, error = %e, "Cannot update reservation status");
            }
        }
    }

    /// Run `body` inside the before/after bracket of `step`.
    ///
    /// The "after" update runs whether `body` succeeds, fails or panics; a panic is
    /// resumed once the update is written. A body that succeeds after the job deadline
    /// is reported as [`JobError::Timeout`]. A body interrupted by shutdown does not count
    /// the step.
    ///
    /// # Errors
    ///
    /// Returns the error of `body`, or [`JobError::Timeout`] if the deadline passed.
    pub async fn run_step<T, F, Fut>(
        &self,
        ctx: &JobContext,
        step: &Step,
        body: F,
    ) -> Result<T, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, JobError>>,
    {
        self.update_status_before(ctx, &step.before).await;

        let outcome = AssertUnwindSafe(body()).catch_unwind().await;

        if matches!(outcome, Ok(Err(JobError::Shutdown))) {
            // Redelivery re-runs the step, count it then.
            self.update_status_after(ctx, &step.after, 0, None).await;
        } else {
            self.update_status_after(ctx, &step.after, step.add_steps, Some(&step.key))
                .await;
        }

        match outcome {
            Ok(Ok(_)) if ctx.is_timed_out() => Err(JobError::Timeout),
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Finalize after a (sub-)step: fail on error, otherwise try to succeed.
    ///
    /// An interrupted job ([`JobError::Shutdown`]) leaves the reservation in flight so the
    /// redelivered task can finish it.
    pub async fn finish_step(&self, ctx: &JobContext, result: &Result<(), JobError>) {
        match result {
            Ok(()) => self.finish_with_success(ctx).await,
            Err(JobError::Shutdown) => {
                tracing::info!("Job interrupted by shutdown, reservation stays in flight");
            }
            Err(e) => self.finish_with_error(ctx, e).await,
        }
    }

    /// Mark the reservation successful if all of its steps are done.
    pub async fn finish_with_success(&self, ctx: &JobContext) {
        match self
            .store
            .finish_with_success(ctx.account_id(), ctx.reservation_id())
            .await
        {
            Ok(true) => {
                ReservationMetrics::record_finished(ctx.job_type(), true);
                tracing::info!("Reservation finished successfully");
            }
            Ok(false) => {
                tracing::debug!("Reservation has pending steps or is already finished");
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot finish reservation with success");
            }
        }
    }

    /// Mark the reservation failed with the text of `error`.
    pub async fn finish_with_error(&self, ctx: &JobContext, error: &JobError) {
        let message = error.to_string();
        match self
            .store
            .finish_with_error(ctx.account_id(), ctx.reservation_id(), message.clone())
            .await
        {
            Ok(true) => {
                ReservationMetrics::record_finished(ctx.job_type(), false);
                tracing::warn!(error = %message, "Reservation finished with error");
            }
            Ok(false) => {
                tracing::debug!(
                    error = %message,
                    "Reservation already finished, error not recorded"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    job_error = %message,
                    "Cannot finish reservation with error"
                );
            }
        }
    }
}

impl std::fmt::Debug for StepTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTracker").finish_non_exhaustive()
    }
}
