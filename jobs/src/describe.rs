//! Waiting for a provider to report addresses of freshly launched instances.

use crate::{JobEnvironment, ResultExt};
use provisioning_core::clouds::InstanceDescription;
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::reservation::InstanceDetail;
use provisioning_runtime::wait_and_retry;
use std::future::Future;

const NOT_DESCRIBED: &str = "instances not described yet";

fn is_not_described(error: &JobError) -> bool {
    matches!(error, JobError::Transient(message) if message == NOT_DESCRIBED)
}

/// Poll `describe` with the environment's backoff until it reports instances.
///
/// Empty answers and transient provider errors are retried. Running out of attempts on an
/// empty answer is not an error: the instances exist, only their addresses are missing.
pub(crate) async fn wait_for_descriptions<F, Fut>(
    env: &JobEnvironment,
    ctx: &JobContext,
    mut describe: F,
) -> Result<Vec<InstanceDescription>, JobError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<InstanceDescription>, JobError>>,
{
    let result = wait_and_retry(ctx, env.describe_backoff(), JobError::is_transient, || {
        let pending = describe();
        async move {
            let descriptions = pending.await?;
            if descriptions.is_empty() {
                return Err(JobError::Transient(NOT_DESCRIBED.to_string()));
            }
            Ok(descriptions)
        }
    })
    .await;

    match result {
        Err(e) if is_not_described(&e) => {
            tracing::warn!("Provider did not describe the instances, leaving addresses empty");
            Ok(Vec::new())
        }
        other => other,
    }
}

/// Store the addresses of every described instance.
pub(crate) async fn save_descriptions(
    env: &JobEnvironment,
    ctx: &JobContext,
    descriptions: Vec<InstanceDescription>,
) -> Result<(), JobError> {
    for description in descriptions {
        let detail = InstanceDetail {
            public_ipv4: description.public_ipv4,
            public_dns: description.public_dns,
        };
        env.reservations()
            .update_instance_description(
                ctx.account_id(),
                ctx.reservation_id(),
                description.id,
                detail,
            )
            .await
            .job_context("cannot update instance description")?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn only_the_empty_answer_marker_is_swallowed() {
        assert!(is_not_described(&JobError::Transient(NOT_DESCRIBED.to_string())));
        assert!(!is_not_described(&JobError::Transient("throttled".to_string())));
        assert!(!is_not_described(&JobError::failed(NOT_DESCRIBED)));
    }
}
