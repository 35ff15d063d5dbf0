//! Broker-backed queue tests.
//!
//! These need a running Redpanda (or Kafka) broker:
//!
//! ```bash
//! docker run -d -p 9092:9092 redpandadata/redpanda:latest redpanda start --smp 1 --overprovisioned \
//!     --set redpanda.auto_create_topics_enabled=true
//! REDPANDA_BROKERS=localhost:9092 cargo test -p provisioning-redpanda -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use chrono::Utc;
use provisioning_core::queue::{JobQueue, QueueError};
use provisioning_core::reservation::{AccountId, ReservationId};
use provisioning_core::task::{Task, TaskId};
use provisioning_redpanda::RedpandaJobQueue;
use std::time::Duration;

fn brokers() -> String {
    std::env::var("REDPANDA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string())
}

/// Fresh topic and group per test so runs never see each other's messages.
fn queue() -> RedpandaJobQueue {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    RedpandaJobQueue::builder()
        .brokers(brokers())
        .topic(format!("jobs-{suffix}"))
        .consumer_group(format!("workers-{suffix}"))
        .dead_letter_topic(format!("jobs-failed-{suffix}"))
        .poll_interval(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn task(reservation: i64) -> Task {
    Task {
        id: TaskId::new(),
        job_type: "no_operation".to_string(),
        body: serde_json::to_vec(&serde_json::json!({
            "account_id": 1,
            "reservation_id": reservation,
        }))
        .unwrap(),
        account_id: AccountId::new(1),
        reservation_id: ReservationId::new(reservation),
        trace_id: Some(format!("trace-{reservation}")),
        edge_id: None,
        enqueued_at: Utc::now(),
    }
}

async fn claim_within(
    queue: &RedpandaJobQueue,
    attempts: usize,
) -> provisioning_core::task::ClaimedTask {
    for _ in 0..attempts {
        if let Some(claimed) = queue.claim().await.unwrap() {
            return claimed;
        }
    }
    panic!("no task delivered");
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
#[ignore = "requires a running Redpanda broker"]
async fn enqueued_task_is_claimed_and_acked() {
    let queue = queue();
    let sent = task(10);
    let id = queue.enqueue(sent.clone()).await.unwrap();

    let claimed = claim_within(&queue, 15).await;
    assert_eq!(claimed.task.id, id);
    assert_eq!(claimed.task.trace_id, sent.trace_id);
    assert_eq!(claimed.lease.attempt, 1);

    queue.heartbeat(&claimed.lease).await.unwrap();
    queue.ack(&claimed.lease).await.unwrap();

    let second_ack = queue.ack(&claimed.lease).await;
    assert!(matches!(second_ack, Err(QueueError::LeaseNotFound(_))));
}

#[tokio::test]
#[ignore = "requires a running Redpanda broker"]
async fn failed_task_releases_its_lease() {
    let queue = queue();
    queue.enqueue(task(11)).await.unwrap();

    let claimed = claim_within(&queue, 15).await;
    queue.fail(&claimed.lease, "job failed on request").await.unwrap();

    let heartbeat = queue.heartbeat(&claimed.lease).await;
    assert!(matches!(heartbeat, Err(QueueError::LeaseNotFound(_))));
}

#[tokio::test]
#[ignore = "requires a running Redpanda broker"]
async fn stats_count_running_tasks() {
    let queue = queue();
    queue.enqueue(task(12)).await.unwrap();
    queue.enqueue(task(12)).await.unwrap();

    let first = claim_within(&queue, 15).await;
    let second = claim_within(&queue, 15).await;
    assert_eq!(queue.stats().await.unwrap().in_flight, 2);

    // Same reservation key, same partition: finishing the later one first must not commit.
    queue.ack(&second.lease).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().in_flight, 1);
    queue.ack(&first.lease).await.unwrap();
    assert_eq!(queue.stats().await.unwrap().in_flight, 0);
}

#[tokio::test]
#[ignore = "requires a running Redpanda broker"]
async fn empty_topic_claims_nothing() {
    let queue = queue();
    assert!(queue.claim().await.unwrap().is_none());
}
