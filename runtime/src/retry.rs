//! Retry logic with backoff for handling transient failures.
//!
//! Two flavours share one [`RetryPolicy`]:
//!
//! - [`wait_and_retry`]: used inside job handlers. Sleeps go through the
//!   [`JobContext`], so a cancelled or timed out job stops retrying immediately.
//! - [`retry_with_backoff`] / [`retry_with_predicate`]: used by infrastructure code that
//!   has no job context (the dequeue loop reporting results, startup connections).
//!
//! # Example
//!
//! ```rust
//! use provisioning_runtime::retry::{Backoff, RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .backoff(Backoff::Linear)
//!     .unit(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let result = retry_with_backoff(policy, || async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use provisioning_core::context::{JobContext, JobError};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How the delay grows between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `unit`.
    Fixed,
    /// Wait `unit × attempt`.
    Linear,
    /// Wait `unit × 2^(attempt - 1)`.
    Exponential,
    /// Wait the listed delays in order, repeating the last one.
    Schedule(Vec<Duration>),
}

/// Retry policy configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `backoff`: [`Backoff::Linear`]
/// - `unit`: 100ms
/// - `max_delay`: 30 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay growth
    pub backoff: Backoff,
    /// Base delay
    pub unit: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear,
            unit: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            backoff: None,
            unit: None,
            max_delay: None,
        }
    }

    /// Policy that waits the given delays in order, one attempt more than delays.
    #[must_use]
    pub fn schedule(delays: impl IntoIterator<Item = Duration>) -> Self {
        let delays: Vec<Duration> = delays.into_iter().collect();
        let max_attempts = u32::try_from(delays.len()).unwrap_or(u32::MAX).saturating_add(1);
        let max_delay = delays.iter().copied().max().unwrap_or_default();
        Self {
            max_attempts,
            backoff: Backoff::Schedule(delays),
            unit: Duration::ZERO,
            max_delay,
        }
    }

    /// Delay to wait after the given failed attempt (1-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match &self.backoff {
            Backoff::Fixed => self.unit,
            Backoff::Linear => self.unit.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                self.unit.saturating_mul(factor)
            }
            Backoff::Schedule(delays) => {
                let index = usize::try_from(attempt - 1).unwrap_or(usize::MAX);
                delays
                    .get(index)
                    .or_else(|| delays.last())
                    .copied()
                    .unwrap_or_default()
            }
        };

        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    backoff: Option<Backoff>,
    unit: Option<Duration>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set total number of attempts.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set delay growth.
    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set base delay.
    #[must_use]
    pub const fn unit(mut self, unit: Duration) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            unit: self.unit.unwrap_or(defaults.unit),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

/// Run `operation`, retrying transient errors within a job.
///
/// Errors for which `is_transient` returns `false` are returned immediately. After
/// `policy.max_attempts` attempts the last error is returned. Sleeps between attempts
/// are cut short when the job is cancelled, in which case the cancellation error is
/// returned.
///
/// # Errors
///
/// Returns the first non-transient error, the last transient error once attempts are
/// exhausted, or the cancellation error of `ctx`.
///
/// # Example
///
/// ```rust
/// use provisioning_core::context::{JobContext, JobError};
/// use provisioning_core::reservation::{AccountId, ReservationId};
/// use provisioning_runtime::retry::{RetryPolicy, wait_and_retry};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), JobError> {
/// let ctx = JobContext::new(AccountId::new(1), ReservationId::new(1), Duration::from_secs(5));
/// let value = wait_and_retry(&ctx, &RetryPolicy::default(), JobError::is_transient, || async {
///     Ok::<_, JobError>(42)
/// })
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn wait_and_retry<F, Fut, T, P>(
    ctx: &JobContext,
    policy: &RetryPolicy,
    is_transient: P,
    mut operation: F,
) -> Result<T, JobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
    P: Fn(&JobError) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if !is_transient(&err) => return Err(err),
            Err(err) => {
                if attempt >= policy.max_attempts {
                    RetryMetrics::record_exhausted();
                    tracing::warn!(attempt, error = %err, "Transient error persisted, giving up");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt();
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Transient error, retrying"
                );

                ctx.sleep(delay).await?;
                attempt += 1;
            }
        }
    }
}

/// Retry an async operation with backoff.
///
/// # Returns
///
/// Returns `Ok(T)` if the operation succeeds within the attempt limit,
/// or `Err(E)` with the last error if all attempts are exhausted.
///
/// # Errors
///
/// Returns the last error once `policy.max_attempts` attempts failed.
///
/// # Example
///
/// ```rust
/// use provisioning_runtime::retry::{RetryPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_backoff(policy, || async {
///     // Simulated fallible operation
///     Ok::<_, String>(42)
/// }).await?;
///
/// assert_eq!(result, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_: &E| true).await
}

/// Retry an async operation with custom retry logic.
///
/// This function allows you to provide a predicate to determine whether
/// an error is retryable.
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts are exhausted.
///
/// # Example
///
/// ```rust
/// use provisioning_runtime::retry::{RetryPolicy, retry_with_predicate};
///
/// # async fn example() -> Result<(), String> {
/// let policy = RetryPolicy::default();
///
/// let result = retry_with_predicate(
///     policy,
///     || async { Ok::<_, String>(42) },
///     |err: &String| err.contains("transient"),
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    RetryMetrics::record_exhausted();
                    tracing::error!(attempt, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use provisioning_core::reservation::{AccountId, ReservationId};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ctx(timeout: Duration) -> JobContext {
        JobContext::new(AccountId::new(1), ReservationId::new(1), timeout)
    }

    #[test]
    fn test_linear_delay_calculation() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::Linear)
            .unit(Duration::from_millis(100))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn test_exponential_delay_with_cap() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::Exponential)
            .unit(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::builder()
            .backoff(Backoff::Fixed)
            .unit(Duration::from_millis(250))
            .build();

        assert_eq!(policy.delay_for_attempt(1), policy.delay_for_attempt(7));
    }

    #[test]
    fn test_schedule_repeats_last_delay() {
        let policy = RetryPolicy::schedule([500, 1000].map(Duration::from_millis));

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_retry_recovers_from_transient_errors() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = wait_and_retry(
            &ctx(Duration::from_secs(60)),
            &RetryPolicy::default(),
            JobError::is_transient,
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JobError::Transient("not yet".to_string()))
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_retry_returns_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let policy = RetryPolicy::builder().max_attempts(4).build();

        let result: Result<(), _> = wait_and_retry(
            &ctx(Duration::from_secs(60)),
            &policy,
            JobError::is_transient,
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::Transient(format!("attempt {n}")))
                }
            },
        )
        .await;

        assert_eq!(result, Err(JobError::Transient("attempt 3".to_string())));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_retry_stops_on_permanent_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result: Result<(), _> = wait_and_retry(
            &ctx(Duration::from_secs(60)),
            &RetryPolicy::default(),
            JobError::is_transient,
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(JobError::failed("rejected"))
                }
            },
        )
        .await;

        assert_eq!(result, Err(JobError::failed("rejected")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_and_retry_observes_deadline() {
        let policy = RetryPolicy::builder()
            .max_attempts(10)
            .backoff(Backoff::Fixed)
            .unit(Duration::from_secs(5))
            .build();

        let result: Result<(), _> = wait_and_retry(
            &ctx(Duration::from_secs(1)),
            &policy,
            JobError::is_transient,
            || async { Err(JobError::Transient("busy".to_string())) },
        )
        .await;

        assert_eq!(result, Err(JobError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_exhausts_attempts() {
        let policy = RetryPolicy::builder()
            .max_attempts(3)
            .unit(Duration::from_millis(10))
            .build();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("Persistent failure")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            RetryPolicy::default(),
            || {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent error")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
