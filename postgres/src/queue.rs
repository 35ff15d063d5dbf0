//! Durable queue backend on a `job_queue` table.
//!
//! Rows move `pending -> in_flight -> (deleted | failed)`. A claim locks the oldest
//! claimable row with `FOR UPDATE SKIP LOCKED`, so concurrent workers never receive the
//! same task. An in-flight row whose heartbeat is older than the lease timeout is
//! claimable again: that is how tasks of crashed workers are redelivered. Every claim
//! issues a fresh lease token; heartbeat, ack and fail only match the current token, so a
//! worker that lost its lease cannot finalize a task someone else now owns.

use chrono::{DateTime, Utc};
use provisioning_core::queue::{JobQueue, QueueError, QueueFuture};
use provisioning_core::reservation::{AccountId, ReservationId};
use provisioning_core::task::{ClaimedTask, Lease, QueueStats, Task, TaskId};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Configuration of [`PostgresJobQueue`].
#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// Wait before an empty claim returns.
    pub poll_interval: Duration,
    /// Age of the last heartbeat after which an in-flight task is redelivered.
    pub lease_timeout: Duration,
    /// Deliveries after which an abandoned task is failed instead of redelivered.
    pub max_attempts: u32,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(120),
            max_attempts: 5,
        }
    }
}

impl PostgresQueueConfig {
    /// Derive the lease timeout from the worker heartbeat: a task is abandoned after
    /// `max_beats` missed beats. The heartbeat counts as at least one second, so the
    /// lease never expires immediately.
    #[must_use]
    pub fn with_lease(mut self, heartbeat: Duration, max_beats: u32) -> Self {
        self.lease_timeout = heartbeat
            .max(MIN_HEARTBEAT)
            .saturating_mul(max_beats.max(1));
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delivery limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A task that was failed, with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    /// The task.
    pub task: Task,
    /// Reason passed to `fail`, or the abandonment note.
    pub reason: String,
    /// When it failed.
    pub failed_at: DateTime<Utc>,
}

/// `PostgreSQL` [`JobQueue`].
///
/// # Example
///
/// ```no_run
/// use provisioning_postgres::{PostgresJobQueue, PostgresQueueConfig};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let queue = PostgresJobQueue::new(pool, PostgresQueueConfig::default());
/// let abandoned = queue.reclaim_abandoned().await?;
/// println!("Failed {abandoned} abandoned task(s)");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    config: PostgresQueueConfig,
}

impl PostgresJobQueue {
    /// Queue on `pool`. The `job_queue` table must exist, see [`crate::migrate`].
    #[must_use]
    pub const fn new(pool: PgPool, config: PostgresQueueConfig) -> Self {
        Self { pool, config }
    }

    fn lease_secs(&self) -> f64 {
        self.config.lease_timeout.as_secs_f64()
    }

    fn max_attempts(&self) -> i32 {
        i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX)
    }

    /// Fail in-flight tasks whose lease expired after their last allowed delivery.
    ///
    /// Returns the number of tasks failed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Fail`] if the update fails.
    pub async fn reclaim_abandoned(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r"
            UPDATE job_queue
            SET state = 'failed',
                lease_token = NULL,
                failed_reason = 'lease expired after ' || attempts || ' attempt(s)',
                failed_at = now()
            WHERE state = 'in_flight'
              AND heartbeat_at < now() - make_interval(secs => $1)
              AND attempts >= $2
            ",
        )
        .bind(self.lease_secs())
        .bind(self.max_attempts())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Fail(e.to_string()))?;

        let failed = result.rows_affected();
        if failed > 0 {
            tracing::warn!(failed, "Failed abandoned tasks");
            metrics::counter!("queue_abandoned_total", "backend" => "postgres").increment(failed);
        }
        Ok(failed)
    }

    /// Most recently failed tasks, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Claim`] if the query fails.
    pub async fn failed(&self, limit: i64) -> Result<Vec<FailedJob>, QueueError> {
        let rows = sqlx::query(
            r"
            SELECT id, job_type, body, account_id, reservation_id, trace_id, edge_id,
                   enqueued_at, failed_reason, failed_at
            FROM job_queue
            WHERE state = 'failed'
            ORDER BY failed_at DESC
            LIMIT $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Claim(e.to_string()))?;

        rows.iter()
            .map(|row| {
                Ok(FailedJob {
                    task: row_to_task(row)?,
                    reason: row
                        .try_get::<Option<String>, _>("failed_reason")
                        .map_err(|e| QueueError::Serialization(e.to_string()))?
                        .unwrap_or_default(),
                    failed_at: row
                        .try_get::<Option<DateTime<Utc>>, _>("failed_at")
                        .map_err(|e| QueueError::Serialization(e.to_string()))?
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    async fn try_claim(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let row = sqlx::query(
            r"
            UPDATE job_queue
            SET state = 'in_flight',
                lease_token = $1,
                attempts = attempts + 1,
                heartbeat_at = now()
            WHERE id = (
                SELECT id FROM job_queue
                WHERE state = 'pending'
                   OR (state = 'in_flight'
                       AND heartbeat_at < now() - make_interval(secs => $2)
                       AND attempts < $3)
                ORDER BY enqueued_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, job_type, body, account_id, reservation_id, trace_id, edge_id,
                      enqueued_at, attempts
            ",
        )
        .bind(&token)
        .bind(self.lease_secs())
        .bind(self.max_attempts())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError::Claim(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let task = row_to_task(&row)?;
        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let attempt = u32::try_from(attempts).unwrap_or(0);
        if attempt > 1 {
            tracing::info!(job_id = %task.id, attempt, "Redelivering task after lease expiry");
        }

        Ok(Some(ClaimedTask {
            lease: Lease {
                task_id: task.id,
                token,
                attempt,
            },
            task,
        }))
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, QueueError> {
    let decode = |e: sqlx::Error| QueueError::Serialization(e.to_string());
    Ok(Task {
        id: TaskId::from_uuid(row.try_get("id").map_err(decode)?),
        job_type: row.try_get("job_type").map_err(decode)?,
        body: row.try_get("body").map_err(decode)?,
        account_id: AccountId::new(row.try_get("account_id").map_err(decode)?),
        reservation_id: ReservationId::new(row.try_get("reservation_id").map_err(decode)?),
        trace_id: row.try_get("trace_id").map_err(decode)?,
        edge_id: row.try_get("edge_id").map_err(decode)?,
        enqueued_at: row.try_get("enqueued_at").map_err(decode)?,
    })
}

fn expect_lease(rows: u64, lease: &Lease) -> Result<(), QueueError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(QueueError::LeaseNotFound(lease.task_id))
    }
}

impl JobQueue for PostgresJobQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn enqueue(&self, task: Task) -> QueueFuture<'_, TaskId> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO job_queue (
                    id, job_type, body, account_id, reservation_id, trace_id, edge_id, enqueued_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(task.id.as_uuid())
            .bind(&task.job_type)
            .bind(&task.body)
            .bind(task.account_id.get())
            .bind(task.reservation_id.get())
            .bind(&task.trace_id)
            .bind(&task.edge_id)
            .bind(task.enqueued_at)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Enqueue(e.to_string()))?;

            tracing::debug!(job_id = %task.id, job_type = %task.job_type, "Task enqueued");
            Ok(task.id)
        })
    }

    fn claim(&self) -> QueueFuture<'_, Option<ClaimedTask>> {
        Box::pin(async move {
            if let Some(claimed) = self.try_claim().await? {
                return Ok(Some(claimed));
            }
            self.reclaim_abandoned().await?;
            tokio::time::sleep(self.config.poll_interval).await;
            self.try_claim().await
        })
    }

    fn heartbeat<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE job_queue SET heartbeat_at = now()
                WHERE id = $1 AND lease_token = $2 AND state = 'in_flight'
                ",
            )
            .bind(lease.task_id.as_uuid())
            .bind(&lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Heartbeat(e.to_string()))?;

            expect_lease(result.rows_affected(), lease)
        })
    }

    fn ack<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM job_queue WHERE id = $1 AND lease_token = $2 AND state = 'in_flight'",
            )
            .bind(lease.task_id.as_uuid())
            .bind(&lease.token)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))?;

            expect_lease(result.rows_affected(), lease)
        })
    }

    fn fail<'a>(&'a self, lease: &'a Lease, reason: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE job_queue
                SET state = 'failed', lease_token = NULL, failed_reason = $3, failed_at = now()
                WHERE id = $1 AND lease_token = $2 AND state = 'in_flight'
                ",
            )
            .bind(lease.task_id.as_uuid())
            .bind(&lease.token)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Fail(e.to_string()))?;

            expect_lease(result.rows_affected(), lease)
        })
    }

    fn stats(&self) -> QueueFuture<'_, QueueStats> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT count(*) FILTER (WHERE state = 'pending') AS enqueued,
                       count(*) FILTER (WHERE state = 'in_flight') AS in_flight
                FROM job_queue
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Claim(e.to_string()))?;

            let count = |column: &str| -> Result<u64, QueueError> {
                let value: i64 = row
                    .try_get(column)
                    .map_err(|e| QueueError::Serialization(e.to_string()))?;
                Ok(u64::try_from(value).unwrap_or(0))
            };
            Ok(QueueStats {
                enqueued: count("enqueued")?,
                in_flight: count("in_flight")?,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_timeout_follows_heartbeat() {
        let config = PostgresQueueConfig::default().with_lease(Duration::from_secs(30), 10);
        assert_eq!(config.lease_timeout, Duration::from_secs(300));
        let config = PostgresQueueConfig::default().with_lease(Duration::from_secs(30), 0);
        assert_eq!(config.lease_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_heartbeat_never_yields_an_expired_lease() {
        let config = PostgresQueueConfig::default().with_lease(Duration::ZERO, 10);
        assert_eq!(config.lease_timeout, Duration::from_secs(10));
        let config = PostgresQueueConfig::default().with_lease(Duration::ZERO, 0);
        assert_eq!(config.lease_timeout, Duration::from_secs(1));
    }

    #[test]
    fn lost_lease_maps_to_lease_not_found() {
        let lease = Lease {
            task_id: TaskId::new(),
            token: "t".to_string(),
            attempt: 1,
        };
        assert_eq!(expect_lease(1, &lease), Ok(()));
        assert_eq!(
            expect_lease(0, &lease),
            Err(QueueError::LeaseNotFound(lease.task_id))
        );
    }
}
