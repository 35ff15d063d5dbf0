//! Jobs that do nothing but walk a reservation through its steps.
//!
//! Used by integration tests and smoke checks of a deployed worker: they exercise the
//! queue, the dequeue loop and step orchestration without touching any provider.

use crate::JobEnvironment;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::registry::JobArgs;
use provisioning_core::reservation::{AccountId, NewReservation, ReservationDetail, ReservationId};
use provisioning_runtime::Step;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error text of a failure requested through the job arguments.
pub const FAILED_ON_REQUEST: &str = "job failed on request";

const WORK: Duration = Duration::from_millis(10);

/// Arguments of the `no_operation` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoopArgs {
    /// Tenant owning the reservation.
    pub account_id: AccountId,
    /// Reservation to advance.
    pub reservation_id: ReservationId,
    /// Return an error after the simulated work.
    #[serde(default)]
    pub fail: bool,
    /// Additional simulated work in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<u64>,
}

impl NoopArgs {
    /// Successful no-op for a reservation.
    #[must_use]
    pub const fn new(account_id: AccountId, reservation_id: ReservationId) -> Self {
        Self {
            account_id,
            reservation_id,
            fail: false,
            sleep: None,
        }
    }

    /// Fail after the simulated work.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Extend the simulated work.
    #[must_use]
    pub const fn with_sleep(mut self, millis: u64) -> Self {
        self.sleep = Some(millis);
        self
    }
}

impl JobArgs for NoopArgs {
    const JOB_TYPE: &'static str = "no_operation";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

/// Arguments of the `no_operation_two` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoopTwoArgs {
    /// Tenant owning the reservation.
    pub account_id: AccountId,
    /// Reservation to advance.
    pub reservation_id: ReservationId,
    /// Fail the first operation.
    #[serde(default)]
    pub fail1: bool,
    /// Fail the second operation.
    #[serde(default)]
    pub fail2: bool,
}

impl JobArgs for NoopTwoArgs {
    const JOB_TYPE: &'static str = "no_operation_two";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

fn noop_step() -> Step {
    Step::new("noop", "No operation started", "No operation finished")
}

fn operation_one() -> Step {
    Step::new("operation_one", "Operation one started", "Operation one finished")
}

fn operation_two() -> Step {
    Step::new("operation_two", "Operation two started", "Operation two finished")
}

/// Reservation planned for a `no_operation` job.
#[must_use]
pub fn new_reservation(account_id: AccountId) -> NewReservation {
    NewReservation::new(account_id, 1, ReservationDetail::Noop).with_step_titles(["No operation"])
}

/// Reservation planned for a `no_operation_two` job.
#[must_use]
pub fn new_reservation_two(account_id: AccountId) -> NewReservation {
    NewReservation::new(account_id, 2, ReservationDetail::Noop)
        .with_step_titles(["Operation one", "Operation two"])
}

async fn pretend_work(ctx: &JobContext, extra: Option<u64>, fail: bool) -> Result<(), JobError> {
    ctx.sleep(WORK + Duration::from_millis(extra.unwrap_or(0))).await?;
    tracing::info!("No operation finished");
    if fail {
        return Err(JobError::failed(FAILED_ON_REQUEST));
    }
    Ok(())
}

pub(crate) async fn handle_noop(
    env: JobEnvironment,
    ctx: JobContext,
    args: NoopArgs,
) -> Result<(), JobError> {
    env.steps()
        .run_step(&ctx, &noop_step(), || pretend_work(&ctx, args.sleep, args.fail))
        .await
}

pub(crate) async fn handle_noop_two(
    env: JobEnvironment,
    ctx: JobContext,
    args: NoopTwoArgs,
) -> Result<(), JobError> {
    let steps = env.steps();

    let result = steps
        .run_step(&ctx, &operation_one(), || pretend_work(&ctx, None, args.fail1))
        .await;
    steps.finish_step(&ctx, &result).await;
    result?;

    let result = steps
        .run_step(&ctx, &operation_two(), || pretend_work(&ctx, None, args.fail2))
        .await;
    steps.finish_step(&ctx, &result).await;
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_false() {
        let args: NoopTwoArgs =
            serde_json::from_str(r#"{"account_id":1,"reservation_id":2}"#).unwrap();
        assert!(!args.fail1 && !args.fail2);

        let args: NoopArgs =
            serde_json::from_str(r#"{"account_id":1,"reservation_id":2}"#).unwrap();
        assert_eq!(args, NoopArgs::new(AccountId::new(1), ReservationId::new(2)));
    }

    #[test]
    fn planned_steps_match_handlers() {
        assert_eq!(new_reservation(AccountId::new(1)).steps, 1);
        let two = new_reservation_two(AccountId::new(1));
        assert_eq!(two.steps, 2);
        assert_eq!(two.step_titles.len(), 2);
    }

    #[test]
    fn step_keys_are_distinct() {
        assert_ne!(operation_one().key, operation_two().key);
    }
}
