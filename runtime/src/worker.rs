//! Dequeue loop.
//!
//! A [`Worker`] runs `concurrency` identical loops draining one shared [`JobQueue`]. For
//! each claimed task a loop:
//!
//! 1. resolves and decodes the handler through the [`TaskRegistry`]; an unknown type or
//!    a malformed payload fails the task without touching any reservation
//! 2. builds the `job` span and the [`JobContext`] (tenant and reservation from the
//!    decoded arguments, trace id copied from the task or freshly generated)
//! 3. renews the lease on a heartbeat ticker while the handler runs
//! 4. runs the handler under `catch_unwind`, cancelling its context at the deadline and
//!    abandoning it if it does not return within the cancellation grace period
//! 5. finalizes the reservation and acknowledges or fails the task
//!
//! Claim errors are retried with backoff and never surface as job failures. Heartbeat
//! errors are logged; the handler keeps running.
//!
//! # Example
//!
//! ```rust,ignore
//! let worker = Worker::new(queue, registry, StepTracker::new(store), WorkerConfig::default());
//! let handle = worker.start(CancellationToken::new());
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await;
//! ```

use crate::metrics::{JobMetrics, QueueMetrics};
use crate::retry::{RetryPolicy, retry_with_predicate};
use crate::steps::StepTracker;
use futures::FutureExt;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::queue::{JobQueue, QueueError};
use provisioning_core::registry::TaskRegistry;
use provisioning_core::reservation::STATUS_TIMEOUT;
use provisioning_core::task::{ClaimedTask, Lease};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Shortest lease renewal period; shorter intervals are raised to it.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration of the dequeue loop.
///
/// # Default Values
///
/// - `concurrency`: 4
/// - `job_timeout`: 1 hour
/// - `heartbeat_interval`: 30 seconds, never below [`MIN_HEARTBEAT_INTERVAL`]
/// - `poll_interval`: 1 second
/// - `cancel_grace`: 30 seconds
/// - `claim_retry`: exponential from 100ms, capped at 30 seconds
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of parallel loops
    pub concurrency: usize,
    /// Deadline of a single job
    pub job_timeout: Duration,
    /// Lease renewal period
    pub heartbeat_interval: Duration,
    /// Wait between polls of an empty queue, for backends that poll
    pub poll_interval: Duration,
    /// Time a cancelled handler gets to return before it is dropped
    pub cancel_grace: Duration,
    /// Backoff for claim errors and for reporting results
    pub claim_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(30),
            claim_retry: RetryPolicy::builder()
                .max_attempts(5)
                .backoff(crate::retry::Backoff::Exponential)
                .unit(Duration::from_millis(100))
                .max_delay(Duration::from_secs(30))
                .build(),
        }
    }
}

impl WorkerConfig {
    /// Set the number of parallel loops (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the job deadline.
    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Set the lease renewal period, raised to [`MIN_HEARTBEAT_INTERVAL`] when shorter.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the cancellation grace period.
    #[must_use]
    pub const fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set the claim backoff policy.
    #[must_use]
    pub fn with_claim_retry(mut self, policy: RetryPolicy) -> Self {
        self.claim_retry = policy;
        self
    }
}

/// The dequeue loop.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    registry: TaskRegistry,
    steps: StepTracker,
    config: WorkerConfig,
}

impl Worker {
    /// Worker draining `queue` with the handlers of `registry`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: TaskRegistry,
        steps: StepTracker,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            steps,
            config,
        }
    }

    /// Spawn the loops. Cancelling `shutdown` stops claiming and cancels running jobs.
    #[must_use]
    pub fn start(self, shutdown: CancellationToken) -> WorkerHandle {
        let concurrency = self.config.concurrency.max(1);
        let worker = Arc::new(self);

        tracing::info!(
            backend = worker.queue.name(),
            concurrency,
            job_types = ?worker.registry.job_types(),
            "Starting worker"
        );

        let mut loops = JoinSet::new();
        for index in 0..concurrency {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.run_loop(index, shutdown).await });
        }

        let handle = tokio::spawn(async move {
            while let Some(result) = loops.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker loop terminated abnormally");
                }
            }
            tracing::info!("Worker stopped");
        });

        WorkerHandle { shutdown, handle }
    }

    async fn run_loop(&self, index: usize, shutdown: CancellationToken) {
        let mut failures = 0u32;
        tracing::debug!(loop_index = index, "Dequeue loop started");

        loop {
            let claimed = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                result = self.queue.claim() => result,
            };

            match claimed {
                Ok(Some(claimed)) => {
                    failures = 0;
                    self.process(claimed, &shutdown).await;
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    QueueMetrics::record_claim_error(self.queue.name());
                    let delay = self.config.claim_retry.delay_for_attempt(failures);
                    tracing::error!(
                        loop_index = index,
                        attempt = failures,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Cannot claim task, backing off"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::debug!(loop_index = index, "Dequeue loop stopped");
    }

    async fn process(&self, claimed: ClaimedTask, shutdown: &CancellationToken) {
        let ClaimedTask { task, lease } = claimed;

        let job = match self.registry.prepare(&task) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(
                    job_id = %task.id,
                    job_type = %task.job_type,
                    lease = %lease,
                    error = %e,
                    "Cannot prepare task, failing it"
                );
                JobMetrics::record_processed(&task.job_type, "invalid", Duration::ZERO);
                self.report_failure(&lease, &e.to_string()).await;
                return;
            }
        };

        let span = tracing::info_span!(
            "job",
            job_id = %task.id,
            job_type = %task.job_type,
            account_id = %job.account_id(),
            reservation_id = %job.reservation_id(),
            trace_id = tracing::field::Empty,
            edge_id = tracing::field::Empty,
            lease = %lease,
        );

        let ctx = JobContext::new(job.account_id(), job.reservation_id(), self.config.job_timeout)
            .with_job(task.id, task.job_type.clone())
            .with_trace_id(task.trace_id.clone())
            .with_edge_id(task.edge_id.clone())
            .with_cancellation(shutdown.child_token())
            .with_span(span.clone());
        span.record("trace_id", ctx.trace_id());
        if let Some(edge_id) = ctx.edge_id() {
            span.record("edge_id", edge_id);
        }

        async {
            tracing::info!(attempt = lease.attempt, "Job started");
            let started = Instant::now();

            let result = self.execute(job.invoke(ctx.clone()), &ctx, &lease).await;
            let outcome = outcome_label(&result);
            JobMetrics::record_processed(&task.job_type, outcome, started.elapsed());

            if matches!(result, Err(JobError::Shutdown)) {
                tracing::info!("Job interrupted by shutdown, leaving task for redelivery");
                return;
            }

            if matches!(result, Err(JobError::Timeout)) {
                self.steps.update_status_before(&ctx, STATUS_TIMEOUT).await;
            }
            self.steps.finish_step(&ctx, &result).await;

            match result {
                Ok(()) => {
                    tracing::info!(elapsed_ms = started.elapsed().as_millis(), "Job finished");
                    self.report_success(&lease).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, outcome, "Job failed");
                    self.report_failure(&lease, &e.to_string()).await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Run the handler with heartbeats, panic recovery and the deadline.
    async fn execute<F>(&self, handler: F, ctx: &JobContext, lease: &Lease) -> Result<(), JobError>
    where
        F: Future<Output = Result<(), JobError>>,
    {
        let beats = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(lease.clone(), beats.clone());

        let handler = AssertUnwindSafe(handler).catch_unwind();
        tokio::pin!(handler);

        let result = tokio::select! {
            outcome = &mut handler => flatten(outcome),
            () = tokio::time::sleep_until(ctx.deadline()) => {
                tracing::warn!("Job deadline reached, cancelling");
                ctx.cancellation_token().cancel();
                self.await_grace(&mut handler, JobError::Timeout).await
            }
            () = ctx.cancellation_token().cancelled() => {
                self.await_grace(&mut handler, ctx.cancel_error()).await
            }
        };

        beats.cancel();
        if let Err(e) = heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task terminated abnormally");
        }

        match result {
            Err(JobError::Panicked(message)) => Err(JobError::Panicked(message)),
            Err(JobError::Shutdown) if !ctx.is_timed_out() => Err(JobError::Shutdown),
            _ if ctx.is_timed_out() => Err(JobError::Timeout),
            other => other,
        }
    }

    async fn await_grace<F>(&self, handler: F, abandoned: JobError) -> Result<(), JobError>
    where
        F: Future<Output = Result<Result<(), JobError>, Box<dyn Any + Send>>> + Unpin,
    {
        match tokio::time::timeout(self.config.cancel_grace, handler).await {
            Ok(outcome) => flatten(outcome),
            Err(_) => {
                tracing::error!(
                    grace_ms = self.config.cancel_grace.as_millis(),
                    "Job ignored cancellation, abandoning it"
                );
                Err(abandoned)
            }
        }
    }

    fn spawn_heartbeat(&self, lease: Lease, stop: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        () = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            match queue.heartbeat(&lease).await {
                                Ok(()) => tracing::trace!("Lease renewed"),
                                Err(e) => {
                                    QueueMetrics::record_heartbeat_error(queue.name());
                                    tracing::warn!(error = %e, "Cannot renew lease, it may expire");
                                }
                            }
                        }
                    }
                }
            }
            .in_current_span(),
        )
    }

    async fn report_success(&self, lease: &Lease) {
        let result = retry_with_predicate(
            self.config.claim_retry.clone(),
            || self.queue.ack(lease),
            is_retryable,
        )
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "Cannot acknowledge task");
        }
    }

    async fn report_failure(&self, lease: &Lease, reason: &str) {
        let result = retry_with_predicate(
            self.config.claim_retry.clone(),
            || self.queue.fail(lease, reason),
            is_retryable,
        )
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "Cannot mark task failed");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("backend", &self.queue.name())
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const fn is_retryable(error: &QueueError) -> bool {
    !matches!(error, QueueError::LeaseNotFound(_))
}

fn flatten(outcome: Result<Result<(), JobError>, Box<dyn Any + Send>>) -> Result<(), JobError> {
    match outcome {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "Job panicked");
            Err(JobError::Panicked(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

const fn outcome_label(result: &Result<(), JobError>) -> &'static str {
    match result {
        Ok(()) => "success",
        Err(JobError::Timeout) => "timeout",
        Err(JobError::Panicked(_)) => "panic",
        Err(JobError::Shutdown) => "interrupted",
        Err(_) => "failure",
    }
}

/// Handle of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Token cancelling the worker.
    #[must_use]
    pub const fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Whether any loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop claiming, cancel running jobs and wait for every loop to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.wait().await;
    }

    /// Wait for the worker to stop without requesting it.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Worker task terminated abnormally");
        }
    }
}
