//! Integration tests for step orchestration
//!
//! Exercise the before/after bracket and the terminal transitions against the in-memory
//! reservation store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use futures::FutureExt;
use proptest::prelude::*;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::reservation::{AccountId, NewReservation, Reservation, ReservationDetail};
use provisioning_core::store::ReservationStore;
use provisioning_runtime::{Step, StepTracker};
use provisioning_testing::{InMemoryReservationStore, test_clock};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn setup(
    steps: i32,
) -> (Arc<InMemoryReservationStore>, StepTracker, JobContext, Reservation) {
    let store = Arc::new(InMemoryReservationStore::new(test_clock()));
    let reservation = store
        .create(NewReservation::new(AccountId::new(7), steps, ReservationDetail::Noop))
        .await
        .unwrap();
    let tracker = StepTracker::new(store.clone());
    let ctx = JobContext::new(reservation.account_id, reservation.id, Duration::from_secs(60))
        .with_job(provisioning_core::TaskId::new(), "no_operation");
    (store, tracker, ctx, reservation)
}

async fn explode() -> Result<(), JobError> {
    panic!("boom")
}

#[tokio::test]
async fn single_step_success() {
    let (store, tracker, ctx, reservation) = setup(1).await;
    let step = Step::new("noop", "No operation started", "No operation finished");

    let result = tracker.run_step(&ctx, &step, || async { Ok(()) }).await;
    tracker.finish_step(&ctx, &result).await;

    let finished = store.snapshot(reservation.id).unwrap();
    assert_eq!(finished.status, "No operation finished");
    assert_eq!(finished.step, 1);
    assert_eq!(finished.success, Some(true));
    assert!(finished.finished_at.is_some());
}

#[tokio::test]
async fn error_still_counts_step_and_fails_reservation() {
    let (store, tracker, ctx, reservation) = setup(1).await;
    let step = Step::new("noop", "No operation started", "No operation finished");

    let result: Result<(), JobError> = tracker
        .run_step(&ctx, &step, || async { Err(JobError::failed("job failed on request")) })
        .await;
    tracker.finish_step(&ctx, &result).await;

    let finished = store.snapshot(reservation.id).unwrap();
    assert_eq!(finished.status, "No operation finished");
    assert_eq!(finished.step, 1);
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.error, "job failed on request");
}

#[tokio::test]
async fn failure_in_second_step_keeps_first_step_visible() {
    let (store, tracker, ctx, reservation) = setup(2).await;
    let one = Step::new("one", "Operation one started", "Operation one finished");
    let two = Step::new("two", "Operation two started", "Operation two finished");

    let first = tracker.run_step(&ctx, &one, || async { Ok(()) }).await;
    tracker.finish_step(&ctx, &first).await;
    assert_eq!(store.snapshot(reservation.id).unwrap().success, None);

    let second: Result<(), JobError> = tracker
        .run_step(&ctx, &two, || async { Err(JobError::failed("boom")) })
        .await;
    tracker.finish_step(&ctx, &second).await;

    let finished = store.snapshot(reservation.id).unwrap();
    assert_eq!(finished.step, 2);
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.error, "boom");
}

#[tokio::test]
async fn panic_writes_after_status_then_resumes() {
    let (store, tracker, ctx, reservation) = setup(1).await;
    let step = Step::new("noop", "No operation started", "No operation finished");

    let outcome = AssertUnwindSafe(tracker.run_step(&ctx, &step, explode))
        .catch_unwind()
        .await;

    assert!(outcome.is_err());
    let current = store.snapshot(reservation.id).unwrap();
    assert_eq!(current.status, "No operation finished");
    assert_eq!(current.step, 1);
    assert_eq!(current.success, None);
}

#[tokio::test(start_paused = true)]
async fn success_after_deadline_is_timeout() {
    let (store, tracker, _, reservation) = setup(1).await;
    let ctx = JobContext::new(reservation.account_id, reservation.id, Duration::from_secs(1));
    let step = Step::new("slow", "Launching instance(s)", "Launched instance(s)");

    let result = tracker
        .run_step(&ctx, &step, || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(JobError::Timeout)));

    tracker.finish_step(&ctx, &result).await;
    let finished = store.snapshot(reservation.id).unwrap();
    assert_eq!(finished.status, "Timeout");
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.error, "context timeout: deadline exceeded");
}

#[tokio::test]
async fn shutdown_leaves_reservation_in_flight() {
    let (store, tracker, _, reservation) = setup(1).await;
    let token = CancellationToken::new();
    let ctx = JobContext::new(reservation.account_id, reservation.id, Duration::from_secs(60))
        .with_cancellation(token.clone());
    let step = Step::new("noop", "No operation started", "No operation finished");
    token.cancel();

    let result = tracker
        .run_step(&ctx, &step, || ctx.sleep(Duration::from_secs(10)))
        .await;
    assert!(matches!(result, Err(JobError::Shutdown)));
    tracker.finish_step(&ctx, &result).await;

    let current = store.snapshot(reservation.id).unwrap();
    assert_eq!(current.step, 0);
    assert_eq!(current.success, None);
}

#[tokio::test]
async fn store_errors_are_not_job_errors() {
    let (store, tracker, ctx, reservation) = setup(1).await;
    store.reject_updates(true);
    let step = Step::new("noop", "No operation started", "No operation finished");

    let result = tracker.run_step(&ctx, &step, || async { Ok(()) }).await;
    assert!(result.is_ok());

    let current = store.snapshot(reservation.id).unwrap();
    assert_eq!(current.status, "Created");
}

#[tokio::test]
async fn terminal_state_is_written_once() {
    let (store, tracker, ctx, reservation) = setup(1).await;
    let step = Step::new("noop", "No operation started", "No operation finished");

    let result = tracker.run_step(&ctx, &step, || async { Ok(()) }).await;
    tracker.finish_step(&ctx, &result).await;
    tracker
        .finish_with_error(&ctx, &JobError::failed("too late"))
        .await;

    let finished = store.snapshot(reservation.id).unwrap();
    assert_eq!(finished.success, Some(true));
    assert!(finished.error.is_empty());
}

proptest! {
    #[test]
    fn step_counter_is_monotonic_and_bounded(
        total in 1i32..6,
        updates in prop::collection::vec((0i32..4, 0usize..4), 0..20),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (store, tracker, ctx, reservation) = setup(total).await;
            let mut previous = 0;
            for (add_steps, key) in updates {
                let key = format!("step-{key}");
                tracker
                    .update_status_after(&ctx, "progress", add_steps, Some(&key))
                    .await;
                let current = store.snapshot(reservation.id).unwrap().step;
                assert!(current >= previous);
                assert!(current <= total);
                previous = current;
            }
        });
    }
}
