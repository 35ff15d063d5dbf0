//! Integration tests for the dequeue loop
//!
//! Drive a [`Worker`] over the in-process queue and in-memory reservation store, and
//! observe outcomes the way an operator would: through reservation rows and the queue.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use provisioning_core::context::{JobContext, JobError};
use provisioning_core::queue::JobQueue;
use provisioning_core::registry::{JobArgs, TaskRegistry};
use provisioning_core::reservation::{
    AccountId, NewReservation, Reservation, ReservationDetail, ReservationId,
};
use provisioning_core::store::ReservationStore;
use provisioning_core::task::Task;
use provisioning_runtime::{
    MIN_HEARTBEAT_INTERVAL, Step, StepTracker, Worker, WorkerConfig, WorkerHandle,
};
use provisioning_testing::{InMemoryJobQueue, InMemoryReservationStore, test_clock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Behavior {
    Succeed,
    Fail(String),
    Panic,
    /// Sleep through the job context, honoring cancellation.
    Sleep(u64),
    /// Sleep ignoring cancellation.
    Stubborn(u64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TestArgs {
    account_id: AccountId,
    reservation_id: ReservationId,
    behavior: Behavior,
}

impl JobArgs for TestArgs {
    const JOB_TYPE: &'static str = "test_job";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UnregisteredArgs {
    account_id: AccountId,
    reservation_id: ReservationId,
}

impl JobArgs for UnregisteredArgs {
    const JOB_TYPE: &'static str = "unregistered_job";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

struct Harness {
    queue: Arc<InMemoryJobQueue>,
    store: Arc<InMemoryReservationStore>,
    seen_trace_ids: Arc<Mutex<Vec<String>>>,
    handle: WorkerHandle,
}

fn test_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_concurrency(1)
        .with_job_timeout(Duration::from_secs(60))
        .with_heartbeat_interval(Duration::from_secs(1))
        .with_cancel_grace(Duration::from_secs(2))
}

fn registry(steps: StepTracker, seen: Arc<Mutex<Vec<String>>>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register::<TestArgs, _, _>(move |ctx: JobContext, args: TestArgs| {
        let steps = steps.clone();
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(ctx.trace_id().to_string());
            let step = Step::new("work", "Working", "Worked");
            let sleeper = ctx.clone();
            steps
                .run_step(&ctx, &step, || async move {
                    match args.behavior {
                        Behavior::Succeed => Ok(()),
                        Behavior::Fail(message) => Err(JobError::failed(message)),
                        Behavior::Panic => panic!("boom"),
                        Behavior::Sleep(secs) => sleeper.sleep(Duration::from_secs(secs)).await,
                        Behavior::Stubborn(secs) => {
                            tokio::time::sleep(Duration::from_secs(secs)).await;
                            Ok(())
                        }
                    }
                })
                .await
        }
    });
    registry
}

fn start(config: WorkerConfig) -> Harness {
    let queue = Arc::new(InMemoryJobQueue::with_poll_interval(Duration::from_millis(50)));
    let store = Arc::new(InMemoryReservationStore::new(test_clock()));
    let steps = StepTracker::new(store.clone());
    let seen_trace_ids = Arc::new(Mutex::new(Vec::new()));

    let worker = Worker::new(
        queue.clone(),
        registry(steps.clone(), Arc::clone(&seen_trace_ids)),
        steps,
        config,
    );
    let handle = worker.start(CancellationToken::new());

    Harness {
        queue,
        store,
        seen_trace_ids,
        handle,
    }
}

impl Harness {
    async fn reservation(&self) -> Reservation {
        self.store
            .create(NewReservation::new(AccountId::new(1), 1, ReservationDetail::Noop))
            .await
            .unwrap()
    }

    async fn submit(&self, behavior: Behavior) -> Reservation {
        let reservation = self.reservation().await;
        let task = Task::new(&TestArgs {
            account_id: reservation.account_id,
            reservation_id: reservation.id,
            behavior,
        })
        .unwrap();
        self.queue.enqueue(task).await.unwrap();
        reservation
    }

    async fn drained(&self) {
        assert!(
            self.queue.wait_drained(Duration::from_secs(600)).await,
            "queue did not drain"
        );
    }

    fn snapshot(&self, reservation: &Reservation) -> Reservation {
        self.store.snapshot(reservation.id).expect("reservation exists")
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn successful_job_finishes_reservation_and_acks() {
    let harness = start(test_config());
    let reservation = harness.submit(Behavior::Succeed).await;
    harness.drained().await;

    let finished = harness.snapshot(&reservation);
    assert_eq!(finished.success, Some(true));
    assert_eq!(finished.step, 1);
    assert_eq!(finished.status, "Worked");
    assert_eq!(harness.queue.acked().len(), 1);
    assert!(harness.queue.failed().is_empty());

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_job_records_error_and_fails_task() {
    let harness = start(test_config());
    let reservation = harness
        .submit(Behavior::Fail("job failed on request".to_string()))
        .await;
    harness.drained().await;

    let finished = harness.snapshot(&reservation);
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.error, "job failed on request");
    assert_eq!(finished.status, "Worked");

    let failed = harness.queue.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, "job failed on request");

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn panic_is_contained_and_loop_keeps_running() {
    let harness = start(test_config());
    let panicked = harness.submit(Behavior::Panic).await;
    let next = harness.submit(Behavior::Succeed).await;
    harness.drained().await;

    let panicked = harness.snapshot(&panicked);
    assert_eq!(panicked.success, Some(false));
    assert_eq!(panicked.error, "job panicked: boom");
    // The step bracket still wrote its "after" status.
    assert_eq!(panicked.status, "Worked");

    assert_eq!(harness.snapshot(&next).success, Some(true));
    assert!(harness.handle.is_running());

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_job_type_fails_without_touching_reservation() {
    let harness = start(test_config());
    let reservation = harness.reservation().await;
    let task = Task::new(&UnregisteredArgs {
        account_id: reservation.account_id,
        reservation_id: reservation.id,
    })
    .unwrap();
    harness.queue.enqueue(task).await.unwrap();
    harness.drained().await;

    let failed = harness.queue.failed();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].reason.contains("unregistered_job"));

    let untouched = harness.snapshot(&reservation);
    assert_eq!(untouched.status, "Created");
    assert_eq!(untouched.success, None);

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_fails_task() {
    let harness = start(test_config());
    let reservation = harness.reservation().await;
    let mut task = Task::new(&TestArgs {
        account_id: reservation.account_id,
        reservation_id: reservation.id,
        behavior: Behavior::Succeed,
    })
    .unwrap();
    task.body = b"not json".to_vec();
    harness.queue.enqueue(task).await.unwrap();
    harness.drained().await;

    assert_eq!(harness.queue.failed().len(), 1);
    assert_eq!(harness.snapshot(&reservation).success, None);

    harness.handle.stop().await;
}

// ============================================================================
// Deadlines and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cooperative_job_times_out() {
    let harness = start(test_config().with_job_timeout(Duration::from_secs(5)));
    let reservation = harness.submit(Behavior::Sleep(3600)).await;
    harness.drained().await;

    let finished = harness.snapshot(&reservation);
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.status, "Timeout");
    assert_eq!(finished.error, "context timeout: deadline exceeded");

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stubborn_job_is_abandoned_after_grace() {
    let harness = start(test_config().with_job_timeout(Duration::from_secs(5)));
    let reservation = harness.submit(Behavior::Stubborn(3600)).await;
    let started = tokio::time::Instant::now();
    harness.drained().await;

    // Deadline plus grace, nowhere near the hour the handler wanted.
    assert!(started.elapsed() < Duration::from_secs(60));

    let finished = harness.snapshot(&reservation);
    assert_eq!(finished.success, Some(false));
    assert_eq!(finished.error, "context timeout: deadline exceeded");
    assert_eq!(harness.queue.failed().len(), 1);

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_task_for_redelivery() {
    let harness = start(test_config());
    let reservation = harness.submit(Behavior::Sleep(3600)).await;

    // Let the loop claim the task and start the handler.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.in_flight, 1);

    let queue = harness.queue.clone();
    let store = harness.store.clone();
    harness.handle.stop().await;

    assert!(queue.acked().is_empty());
    assert!(queue.failed().is_empty());
    assert!(!queue.is_drained());

    let interrupted = store.snapshot(reservation.id).unwrap();
    assert_eq!(interrupted.success, None);
}

#[tokio::test(start_paused = true)]
async fn stop_returns_promptly_when_idle() {
    let harness = start(test_config().with_concurrency(3));
    let started = tokio::time::Instant::now();
    harness.handle.stop().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Leases, tracing and concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lease_is_renewed_while_job_runs() {
    let harness = start(test_config());
    harness.submit(Behavior::Sleep(5)).await;
    harness.drained().await;

    assert!(harness.queue.heartbeats() >= 4, "heartbeats: {}", harness.queue.heartbeats());

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn zero_heartbeat_interval_still_renews_lease() {
    let config = test_config().with_heartbeat_interval(Duration::ZERO);
    assert_eq!(config.heartbeat_interval, MIN_HEARTBEAT_INTERVAL);

    let harness = start(config);
    let reservation = harness.submit(Behavior::Sleep(5)).await;
    harness.drained().await;

    assert_eq!(harness.snapshot(&reservation).success, Some(true));
    assert!(harness.queue.heartbeats() >= 4, "heartbeats: {}", harness.queue.heartbeats());

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn zero_heartbeat_field_is_raised_when_renewing() {
    let mut config = test_config();
    config.heartbeat_interval = Duration::ZERO;

    let harness = start(config);
    harness.submit(Behavior::Sleep(3)).await;
    harness.drained().await;

    assert!(harness.queue.heartbeats() >= 2, "heartbeats: {}", harness.queue.heartbeats());

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_errors_do_not_fail_the_job() {
    let harness = start(test_config());
    harness.queue.reject_heartbeats(true);
    let reservation = harness.submit(Behavior::Sleep(5)).await;
    harness.drained().await;

    assert_eq!(harness.snapshot(&reservation).success, Some(true));
    assert_eq!(harness.queue.heartbeats(), 0);

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn trace_id_is_propagated_or_generated() {
    let harness = start(test_config());
    let reservation = harness.reservation().await;
    let traced = Task::new(&TestArgs {
        account_id: reservation.account_id,
        reservation_id: reservation.id,
        behavior: Behavior::Succeed,
    })
    .unwrap()
    .with_trace_id("4bf92f3577b34da6");
    harness.queue.enqueue(traced).await.unwrap();
    harness.submit(Behavior::Succeed).await;
    harness.drained().await;

    let seen = harness.seen_trace_ids.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], "4bf92f3577b34da6");
    assert!(!seen[1].is_empty());
    assert_ne!(seen[1], seen[0]);

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn loops_run_jobs_in_parallel() {
    let harness = start(test_config().with_concurrency(4));
    let started = tokio::time::Instant::now();
    for _ in 0..4 {
        harness.submit(Behavior::Sleep(10)).await;
    }
    harness.drained().await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(harness.queue.acked().len(), 4);

    harness.handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reclaimed_task_does_not_double_count_steps() {
    let harness = start(test_config());
    let reservation = harness.reservation().await;
    let steps = StepTracker::new(harness.store.clone());
    let ctx = JobContext::new(reservation.account_id, reservation.id, Duration::from_secs(60));

    // A previous delivery completed the step but crashed before acknowledging.
    steps
        .update_status_after(&ctx, "Worked", 1, Some("work"))
        .await;
    let task = Task::new(&TestArgs {
        account_id: reservation.account_id,
        reservation_id: reservation.id,
        behavior: Behavior::Succeed,
    })
    .unwrap();
    harness.queue.enqueue(task).await.unwrap();
    harness.drained().await;

    let finished = harness.snapshot(&reservation);
    assert_eq!(finished.step, 1);
    assert_eq!(finished.success, Some(true));

    harness.handle.stop().await;
}
