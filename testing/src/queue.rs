//! In-process queue backend.
//!
//! Single-process FIFO for tests and local runs: the queue lives exactly as long as the
//! process, so there is no crash recovery. Failed tasks are discarded from the queue and
//! kept in an inspectable list.

use provisioning_core::queue::{JobQueue, QueueError, QueueFuture};
use provisioning_core::task::{ClaimedTask, Lease, QueueStats, Task, TaskId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// A task the queue gave up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedTask {
    /// The task.
    pub task: Task,
    /// Reason passed to `fail`.
    pub reason: String,
}

#[derive(Debug)]
struct InFlight {
    task: Task,
    token: String,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Task>,
    in_flight: HashMap<TaskId, InFlight>,
    attempts: HashMap<TaskId, u32>,
    failed: Vec<FailedTask>,
    acked: Vec<TaskId>,
    heartbeats: u64,
    reject_enqueues: bool,
    reject_heartbeats: bool,
}

/// In-process [`JobQueue`].
///
/// # Example
///
/// ```
/// use provisioning_testing::InMemoryJobQueue;
/// use provisioning_core::queue::JobQueue;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = InMemoryJobQueue::new();
/// // Nothing queued: claim returns after the poll window.
/// assert!(queue.claim().await?.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl InMemoryJobQueue {
    /// Empty queue with a 100ms poll window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(100))
    }

    /// Empty queue whose `claim` waits at most `poll_interval` for work.
    #[must_use]
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self) -> Option<ClaimedTask> {
        let mut state = self.lock();
        let task = state.pending.pop_front()?;

        let attempt = {
            let attempts = state.attempts.entry(task.id).or_insert(0);
            *attempts += 1;
            *attempts
        };
        let token = Uuid::new_v4().to_string();
        state.in_flight.insert(
            task.id,
            InFlight {
                task: task.clone(),
                token: token.clone(),
            },
        );

        Some(ClaimedTask {
            lease: Lease {
                task_id: task.id,
                token,
                attempt,
            },
            task,
        })
    }

    fn release(&self, lease: &Lease) -> Result<Task, QueueError> {
        let mut state = self.lock();
        match state.in_flight.get(&lease.task_id) {
            Some(entry) if entry.token == lease.token => state
                .in_flight
                .remove(&lease.task_id)
                .map(|entry| entry.task)
                .ok_or(QueueError::LeaseNotFound(lease.task_id)),
            _ => Err(QueueError::LeaseNotFound(lease.task_id)),
        }
    }

    /// Make every following `enqueue` fail (or succeed again).
    pub fn reject_enqueues(&self, reject: bool) {
        self.lock().reject_enqueues = reject;
    }

    /// Make every following `heartbeat` fail (or succeed again).
    pub fn reject_heartbeats(&self, reject: bool) {
        self.lock().reject_heartbeats = reject;
    }

    /// Simulate a lease expiry: the in-flight task becomes claimable again and the old
    /// lease is invalidated.
    ///
    /// Returns `false` if the task was not in flight.
    pub fn expire_lease(&self, task_id: TaskId) -> bool {
        let mut state = self.lock();
        match state.in_flight.remove(&task_id) {
            Some(entry) => {
                state.pending.push_back(entry.task);
                drop(state);
                self.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Tasks that were failed, oldest first.
    #[must_use]
    pub fn failed(&self) -> Vec<FailedTask> {
        self.lock().failed.clone()
    }

    /// Ids of acknowledged tasks, oldest first.
    #[must_use]
    pub fn acked(&self) -> Vec<TaskId> {
        self.lock().acked.clone()
    }

    /// Number of heartbeats received.
    #[must_use]
    pub fn heartbeats(&self) -> u64 {
        self.lock().heartbeats
    }

    /// Whether no task is pending or in flight.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Wait until the queue is drained, polling every 10ms, for at most `timeout`.
    ///
    /// Returns whether the queue drained in time.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_drained() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_drained()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn enqueue(&self, task: Task) -> QueueFuture<'_, TaskId> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.reject_enqueues {
                return Err(QueueError::Enqueue("queue rejects enqueues".to_string()));
            }

            let id = task.id;
            tracing::debug!(job_id = %id, job_type = %task.job_type, "Task enqueued");
            state.pending.push_back(task);
            drop(state);
            self.notify.notify_one();
            Ok(id)
        })
    }

    fn claim(&self) -> QueueFuture<'_, Option<ClaimedTask>> {
        Box::pin(async move {
            let deadline = Instant::now() + self.poll_interval;
            loop {
                let notified = self.notify.notified();
                if let Some(claimed) = self.try_claim() {
                    return Ok(Some(claimed));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn heartbeat<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.reject_heartbeats {
                return Err(QueueError::Heartbeat("queue rejects heartbeats".to_string()));
            }
            match state.in_flight.get(&lease.task_id) {
                Some(entry) if entry.token == lease.token => {
                    state.heartbeats += 1;
                    Ok(())
                }
                _ => Err(QueueError::LeaseNotFound(lease.task_id)),
            }
        })
    }

    fn ack<'a>(&'a self, lease: &'a Lease) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let task = self.release(lease)?;
            self.lock().acked.push(task.id);
            Ok(())
        })
    }

    fn fail<'a>(&'a self, lease: &'a Lease, reason: &'a str) -> QueueFuture<'a, ()> {
        Box::pin(async move {
            let task = self.release(lease)?;
            tracing::debug!(job_id = %task.id, reason, "Task discarded");
            self.lock().failed.push(FailedTask {
                task,
                reason: reason.to_string(),
            });
            Ok(())
        })
    }

    fn stats(&self) -> QueueFuture<'_, QueueStats> {
        Box::pin(async move {
            let state = self.lock();
            Ok(QueueStats {
                enqueued: state.pending.len() as u64,
                in_flight: state.in_flight.len() as u64,
            })
        })
    }
}
