//! # Provisioning Jobs
//!
//! The job types the provisioning worker executes.
//!
//! | Job type | Arguments | Steps |
//! |---|---|---|
//! | `no_operation` | [`NoopArgs`] | 1 |
//! | `no_operation_two` | [`NoopTwoArgs`] | 2 |
//! | `launch_instances_aws` | [`LaunchInstancesAwsArgs`] | 3: pubkey, launch, describe |
//! | `launch_instances_gcp` | [`LaunchInstancesGcpArgs`] | 2: launch, describe |
//! | `launch_instances_azure` | [`LaunchInstancesAzureArgs`] | 2: resource group, launch |
//!
//! Every sub-step runs inside [`StepTracker::run_step`], so its "after" status is written on
//! every exit path. Multi-step jobs finalize after each sub-step and stop at the first
//! failure; the dequeue loop finalizes once more with the job result, which is a no-op for
//! an already finished reservation.
//!
//! # Example
//!
//! ```ignore
//! let env = JobEnvironment::new(StepTracker::new(store), pubkeys, clouds);
//! let mut registry = TaskRegistry::new();
//! register_jobs(&mut registry, &env);
//!
//! let worker = Worker::new(queue, registry, env.steps().clone(), WorkerConfig::default());
//! ```

pub mod aws;
pub mod azure;
mod describe;
pub mod enqueue;
pub mod gcp;
pub mod noop;

pub use aws::LaunchInstancesAwsArgs;
pub use azure::LaunchInstancesAzureArgs;
pub use enqueue::{EnqueueError, RequestIds, enqueue, get_or_create_account};
pub use gcp::LaunchInstancesGcpArgs;
pub use noop::{NoopArgs, NoopTwoArgs};

use provisioning_core::clouds::CloudClients;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::registry::{JobArgs, TaskRegistry};
use provisioning_core::store::{PubkeyStore, ReservationStore};
use provisioning_runtime::{RetryPolicy, StepTracker};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Delays between instance describe calls while a provider catches up.
pub const DESCRIBE_BACKOFF_MS: [u64; 5] = [1000, 500, 500, 1000, 2000];

/// Collaborators shared by every job handler.
#[derive(Clone)]
pub struct JobEnvironment {
    steps: StepTracker,
    pubkeys: Arc<dyn PubkeyStore>,
    clouds: Arc<dyn CloudClients>,
    describe_backoff: RetryPolicy,
}

impl JobEnvironment {
    /// Environment with the default describe backoff.
    #[must_use]
    pub fn new(
        steps: StepTracker,
        pubkeys: Arc<dyn PubkeyStore>,
        clouds: Arc<dyn CloudClients>,
    ) -> Self {
        Self {
            steps,
            pubkeys,
            clouds,
            describe_backoff: RetryPolicy::schedule(
                DESCRIBE_BACKOFF_MS.iter().copied().map(Duration::from_millis),
            ),
        }
    }

    /// Override the backoff used while waiting for instance descriptions.
    #[must_use]
    pub fn with_describe_backoff(mut self, policy: RetryPolicy) -> Self {
        self.describe_backoff = policy;
        self
    }

    /// Step tracker writing reservation progress.
    #[must_use]
    pub const fn steps(&self) -> &StepTracker {
        &self.steps
    }

    /// Reservation store behind the step tracker.
    #[must_use]
    pub fn reservations(&self) -> &Arc<dyn ReservationStore> {
        self.steps.store()
    }

    /// Public key store.
    #[must_use]
    pub fn pubkeys(&self) -> &Arc<dyn PubkeyStore> {
        &self.pubkeys
    }

    /// Cloud client factory.
    #[must_use]
    pub fn clouds(&self) -> &Arc<dyn CloudClients> {
        &self.clouds
    }

    /// Backoff used while waiting for instance descriptions.
    #[must_use]
    pub const fn describe_backoff(&self) -> &RetryPolicy {
        &self.describe_backoff
    }
}

impl std::fmt::Debug for JobEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobEnvironment")
            .field("describe_backoff", &self.describe_backoff)
            .finish_non_exhaustive()
    }
}

/// Register every job type of this crate.
pub fn register_jobs(registry: &mut TaskRegistry, env: &JobEnvironment) {
    register(registry, env, noop::handle_noop);
    register(registry, env, noop::handle_noop_two);
    register(registry, env, aws::handle);
    register(registry, env, gcp::handle);
    register(registry, env, azure::handle);
}

fn register<A, Fut>(
    registry: &mut TaskRegistry,
    env: &JobEnvironment,
    handler: fn(JobEnvironment, JobContext, A) -> Fut,
) where
    A: JobArgs,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    let env = env.clone();
    registry.register::<A, _, _>(move |ctx, args| handler(env.clone(), ctx, args));
}

/// Prefix errors with what was being attempted.
pub(crate) trait ResultExt<T> {
    fn job_context(self, what: &str) -> Result<T, JobError>;
}

impl<T, E: Into<JobError>> ResultExt<T> for Result<T, E> {
    fn job_context(self, what: &str) -> Result<T, JobError> {
        self.map_err(|e| e.into().context(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioning_core::store::StoreError;

    #[test]
    fn job_context_prefixes_message() {
        let result: Result<(), StoreError> = Err(StoreError::NotFound("pubkey 7".to_string()));
        let error = result.job_context("cannot get pubkey by id").unwrap_err();
        assert!(error.to_string().starts_with("cannot get pubkey by id: "));
    }

    #[test]
    fn describe_backoff_follows_schedule() {
        let policy =
            RetryPolicy::schedule(DESCRIBE_BACKOFF_MS.iter().copied().map(Duration::from_millis));
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(2000));
    }
}
