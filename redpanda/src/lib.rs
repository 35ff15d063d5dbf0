//! Redpanda queue backend for the provisioning job engine.
//!
//! [`RedpandaJobQueue`] implements [`JobQueue`] over the Kafka protocol with rdkafka, so it
//! works against Redpanda, Apache Kafka or any compatible broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - A task is claimed when the consumer receives its message. The lease token is
//!   `partition:offset`.
//! - Offsets are committed only when a task is acknowledged or failed, and only up to the
//!   lowest offset still running on that partition (see [`OffsetTracker`]).
//! - If the process crashes before commit, the uncommitted tasks are redelivered to the
//!   next consumer in the group. Handlers must tolerate re-execution.
//! - Tasks of one reservation share a message key and therefore a partition.
//!
//! The broker does not know about attempts or heartbeats. Every claim reports attempt 1,
//! heartbeats only check that the lease is still held locally, and the broker's own
//! liveness check is `max.poll.interval.ms`, which must exceed the job timeout.
//!
//! # Example
//!
//! ```no_run
//! use provisioning_redpanda::RedpandaJobQueue;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaJobQueue::builder()
//!     .brokers("localhost:9092")
//!     .topic("provisioning-jobs")
//!     .consumer_group("provisioning-workers")
//!     .dead_letter_topic("provisioning-jobs-failed")
//!     .max_poll_interval(Duration::from_secs(3900))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod offsets;

pub use offsets::{Completion, OffsetTracker};

use chrono::{DateTime, Utc};
use metrics::counter;
use provisioning_core::queue::{JobQueue, QueueError, QueueFuture};
use provisioning_core::task::{ClaimedTask, Lease, QueueStats, Task, TaskId};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Message published to the dead-letter topic when a task fails.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The failed task.
    pub task: Task,
    /// Why it failed.
    pub reason: String,
    /// When the worker gave up on it.
    pub failed_at: DateTime<Utc>,
}

/// Encode a task as a broker message payload.
///
/// # Errors
///
/// Returns [`QueueError::Serialization`] if the task cannot be encoded.
pub fn encode_task(task: &Task) -> Result<Vec<u8>, QueueError> {
    bincode::serialize(task).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Decode a broker message payload into a task.
///
/// # Errors
///
/// Returns [`QueueError::Serialization`] if the payload is not an encoded task.
pub fn decode_task(payload: &[u8]) -> Result<Task, QueueError> {
    bincode::deserialize(payload).map_err(|e| QueueError::Serialization(e.to_string()))
}

/// Build the lease token for a delivered message.
#[must_use]
pub fn lease_token(partition: i32, offset: i64) -> String {
    format!("{partition}:{offset}")
}

fn parse_lease_token(token: &str) -> Option<(i32, i64)> {
    let (partition, offset) = token.split_once(':')?;
    Some((partition.parse().ok()?, offset.parse().ok()?))
}

#[derive(Debug, Default)]
struct Deliveries {
    offsets: OffsetTracker,
    leases: HashMap<String, Task>,
}

impl Deliveries {
    fn holds(&self, lease: &Lease) -> bool {
        self.leases
            .get(&lease.token)
            .is_some_and(|task| task.id == lease.task_id)
    }
}

/// Broker-backed [`JobQueue`].
///
/// One instance owns one producer and one group consumer. It is shared by every dequeue
/// loop of a worker process; concurrent `claim` calls each receive a different message.
pub struct RedpandaJobQueue {
    producer: FutureProducer,
    consumer: Arc<StreamConsumer>,
    topic: String,
    dead_letter_topic: Option<String>,
    timeout: Duration,
    poll_interval: Duration,
    deliveries: Mutex<Deliveries>,
}

impl RedpandaJobQueue {
    /// Create a queue for `topic` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Connection`] if the client cannot be created or the topic
    /// cannot be subscribed.
    pub fn new(brokers: &str, topic: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).topic(topic).build()
    }

    /// Create a new builder for configuring the queue.
    #[must_use]
    pub fn builder() -> RedpandaJobQueueBuilder {
        RedpandaJobQueueBuilder::default()
    }

    /// Topic the queue produces to and consumes from.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn deliveries(&self) -> MutexGuard<'_, Deliveries> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), KafkaError> {
        let record = FutureRecord::to(topic).payload(payload).key(key.as_bytes());
        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(error, _)| error)
    }

    fn commit(&self, partition: i32, offset: i64) -> Result<(), KafkaError> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, partition, Offset::Offset(offset))?;
        self.consumer.commit(&list, CommitMode::Async)
    }

    /// Release a lease and commit whatever became contiguous.
    fn release(
        &self,
        lease: &Lease,
        on_commit_error: fn(String) -> QueueError,
    ) -> Result<(), QueueError> {
        let Some((partition, offset)) = parse_lease_token(&lease.token) else {
            return Err(QueueError::LeaseNotFound(lease.task_id));
        };

        let completion = {
            let mut deliveries = self.deliveries();
            if !deliveries.holds(lease) {
                return Err(QueueError::LeaseNotFound(lease.task_id));
            }
            deliveries.leases.remove(&lease.token);
            deliveries.offsets.finish(partition, offset)
        };

        match completion {
            Completion::Commit(next) => self.commit(partition, next).map_err(|e| {
                tracing::warn!(
                    topic = %self.topic,
                    partition,
                    offset = next,
                    error = %e,
                    "Failed to commit offset (tasks may be redelivered)"
                );
                on_commit_error(e.to_string())
            }),
            Completion::Pending => {
                tracing::trace!(partition, offset, "Offset finished behind a running task");
                Ok(())
            }
            Completion::Unknown => Err(QueueError::LeaseNotFound(lease.task_id)),
        }
    }

    /// Skip a message that cannot be turned into a task.
    fn skip(&self, partition: i32, offset: i64) {
        let completion = {
            let mut deliveries = self.deliveries();
            deliveries.offsets.start(partition, offset);
            deliveries.offsets.finish(partition, offset)
        };
        if let Completion::Commit(next) = completion {
            if let Err(e) = self.commit(partition, next) {
                tracing::warn!(
                    partition,
                    offset = next,
                    error = %e,
                    "Failed to commit skipped offset"
                );
            }
        }
    }
}

/// Builder for configuring a [`RedpandaJobQueue`].
#[derive(Default)]
pub struct RedpandaJobQueueBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    consumer_group: Option<String>,
    dead_letter_topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    poll_interval: Option<Duration>,
    max_poll_interval: Option<Duration>,
    auto_offset_reset: Option<String>,
}

impl RedpandaJobQueueBuilder {
    /// Set the broker addresses as a comma-separated list (e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the task topic.
    ///
    /// Default: `"provisioning-jobs"`
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the consumer group shared by all workers draining the topic.
    ///
    /// Default: `"provisioning-workers"`
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Publish failed tasks to this topic before committing past them.
    ///
    /// Without a dead-letter topic failed tasks are only logged.
    #[must_use]
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"` or `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set how long one `claim` waits for a message before returning `None`.
    ///
    /// Default: 1 second
    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Set `max.poll.interval.ms`, after which the broker considers a silent consumer dead
    /// and hands its partitions to another worker.
    ///
    /// Must exceed the worker's job timeout. Default: 1 hour
    #[must_use]
    pub const fn max_poll_interval(mut self, max_poll_interval: Duration) -> Self {
        self.max_poll_interval = Some(max_poll_interval);
        self
    }

    /// Set where a new consumer group starts reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`, so tasks enqueued before the first worker started are run.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaJobQueue`] and subscribe to its topic.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Connection`] if:
    /// - Brokers not set
    /// - Cannot create producer or consumer
    /// - Cannot subscribe to the topic
    pub fn build(self) -> Result<RedpandaJobQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::Connection("Brokers not configured".to_string()))?;
        let topic = self.topic.unwrap_or_else(|| "provisioning-jobs".to_string());
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| "provisioning-workers".to_string());
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());
        let max_poll_interval = self
            .max_poll_interval
            .unwrap_or(Duration::from_secs(3600));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| QueueError::Connection(format!("Failed to create producer: {e}")))?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", max_poll_interval.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| QueueError::Connection(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| QueueError::Connection(format!("Failed to subscribe to {topic}: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %consumer_group,
            acks = %acks,
            compression = %compression,
            auto_offset_reset = %auto_offset_reset,
            dead_letter_topic = ?self.dead_letter_topic,
            "RedpandaJobQueue created successfully"
        );

        Ok(RedpandaJobQueue {
            producer,
            consumer: Arc::new(consumer),
            topic,
            dead_letter_topic: self.dead_letter_topic,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(1)),
            deliveries: Mutex::new(Deliveries::default()),
        })
    }
}

/// Messages between each assigned partition's position and its high watermark.
fn consumer_lag(
    consumer: &StreamConsumer,
    topic: &str,
    timeout: Duration,
) -> Result<u64, QueueError> {
    let positions = consumer
        .position()
        .map_err(|e| QueueError::Connection(e.to_string()))?;

    let mut lag = 0u64;
    for element in positions.elements_for_topic(topic) {
        let (low, high) = consumer
            .fetch_watermarks(topic, element.partition(), timeout)
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let position = element.offset().to_raw().filter(|o| *o >= 0).unwrap_or(low);
        lag += u64::try_from(high - position).unwrap_or(0);
    }
    Ok(lag)
}

impl JobQueue for RedpandaJobQueue {
    fn name(&self) -> &'static str {
        "redpanda"
    }

    fn enqueue(&self, task: Task) -> QueueFuture<'_, TaskId> {
        Box::pin(async move {
            let payload = encode_task(&task)?;
            // One partition per reservation keeps its tasks in order.
            let key = task.reservation_id.to_string();

            match self.publish(&self.topic, &key, &payload).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        task_id = %task.id,
                        job_type = %task.job_type,
                        "Task published"
                    );
                    Ok(task.id)
                }
                Err(e) => {
                    tracing::error!(
                        topic = %self.topic,
                        task_id = %task.id,
                        error = %e,
                        "Failed to publish task"
                    );
                    Err(QueueError::Enqueue(e.to_string()))
                }
            }
        })
    }

    fn claim(&self) -> QueueFuture<'_, Option<ClaimedTask>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + self.poll_interval;

            loop {
                let received = tokio::time::timeout_at(deadline, self.consumer.recv()).await;
                let (partition, offset, decoded) = match received {
                    Err(_) => return Ok(None),
                    Ok(Err(e)) => return Err(QueueError::Claim(e.to_string())),
                    Ok(Ok(message)) => {
                        let decoded = message
                            .payload()
                            .ok_or_else(|| {
                                QueueError::Serialization("Message has no payload".to_string())
                            })
                            .and_then(decode_task);
                        (message.partition(), message.offset(), decoded)
                    }
                };

                let task = match decoded {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::warn!(
                            topic = %self.topic,
                            partition,
                            offset,
                            error = %e,
                            "Skipping undecodable message"
                        );
                        counter!("queue_undecodable_total", "backend" => "redpanda").increment(1);
                        self.skip(partition, offset);
                        continue;
                    }
                };

                let token = lease_token(partition, offset);
                {
                    let mut deliveries = self.deliveries();
                    deliveries.offsets.start(partition, offset);
                    deliveries.leases.insert(token.clone(), task.clone());
                }

                tracing::trace!(partition, offset, task_id = %task.id, "Task claimed");
                let lease = Lease {
                    task_id: task.id,
                    token,
                    attempt: 1,
                };
                return Ok(Some(ClaimedTask { task, lease }));
            }
        })
    }

    fn heartbeat<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            if self.deliveries().holds(lease) {
                Ok(())
            } else {
                Err(QueueError::LeaseNotFound(lease.task_id))
            }
        })
    }

    fn ack<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move { self.release(lease, QueueError::Ack) })
    }

    fn fail<'a>(&'a self, lease: &'a Lease, reason: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            match &self.dead_letter_topic {
                Some(dead_letter_topic) => {
                    let task = self
                        .deliveries()
                        .leases
                        .get(&lease.token)
                        .filter(|task| task.id == lease.task_id)
                        .cloned()
                        .ok_or(QueueError::LeaseNotFound(lease.task_id))?;
                    let letter = DeadLetter {
                        task,
                        reason: reason.to_string(),
                        failed_at: Utc::now(),
                    };
                    let payload = bincode::serialize(&letter)
                        .map_err(|e| QueueError::Serialization(e.to_string()))?;
                    self.publish(dead_letter_topic, &lease.task_id.to_string(), &payload)
                        .await
                        .map_err(|e| QueueError::Fail(e.to_string()))?;
                    counter!("queue_dead_lettered_total", "backend" => "redpanda").increment(1);
                    tracing::warn!(
                        task_id = %lease.task_id,
                        topic = %dead_letter_topic,
                        reason,
                        "Task dead-lettered"
                    );
                }
                None => {
                    tracing::warn!(
                        task_id = %lease.task_id,
                        reason,
                        "Task failed, committing past it"
                    );
                }
            }
            self.release(lease, QueueError::Fail)
        })
    }

    fn stats(&self) -> QueueFuture<'_, QueueStats> {
        Box::pin(async move {
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            let timeout = self.timeout;
            let enqueued =
                tokio::task::spawn_blocking(move || consumer_lag(&consumer, &topic, timeout))
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))??;

            let in_flight =
                u64::try_from(self.deliveries().offsets.in_flight()).unwrap_or(u64::MAX);
            Ok(QueueStats { enqueued, in_flight })
        })
    }
}
