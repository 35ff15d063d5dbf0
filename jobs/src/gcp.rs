//! `launch_instances_gcp`: insert instances, then fetch their addresses.

use crate::describe::{save_descriptions, wait_for_descriptions};
use crate::{JobEnvironment, ResultExt};
use provisioning_core::clouds::{Authentication, GcpClient, GcpInstanceParams};
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::registry::JobArgs;
use provisioning_core::reservation::{
    AccountId, GcpDetail, GcpReservationDetail, Instance, NewReservation, ReservationDetail,
    ReservationId,
};
use provisioning_runtime::Step;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Instance name pattern used when the request does not name instances.
pub const DEFAULT_NAME_PATTERN: &str = "inst-####";

/// Titles of the planned reservation steps.
pub const STEP_TITLES: [&str; 2] = ["Launch instance(s)", "Fetch instance(s) description"];

/// Arguments of the `launch_instances_gcp` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInstancesGcpArgs {
    /// Tenant owning the reservation.
    pub account_id: AccountId,
    /// Reservation to advance.
    pub reservation_id: ReservationId,
    /// Zone to launch into.
    pub zone: String,
    /// Key to install on the instances.
    pub pubkey_id: i64,
    /// Instance parameters.
    pub detail: GcpDetail,
    /// Image to launch.
    pub image_name: String,
    /// Project the instances are billed to.
    pub project_id: Authentication,
}

impl JobArgs for LaunchInstancesGcpArgs {
    const JOB_TYPE: &'static str = "launch_instances_gcp";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

/// Reservation planned for a `launch_instances_gcp` job.
#[must_use]
pub fn new_reservation(account_id: AccountId, detail: GcpReservationDetail) -> NewReservation {
    NewReservation::new(account_id, 2, ReservationDetail::Gcp(detail)).with_step_titles(STEP_TITLES)
}

fn launch_step() -> Step {
    Step::new("gcp_launch", "Launching instance(s)", "Launched instance(s)")
}

fn describe_step() -> Step {
    Step::new(
        "gcp_describe",
        "Fetching instance(s) description",
        "Instance(s) description fetched",
    )
}

pub(crate) async fn handle(
    env: JobEnvironment,
    ctx: JobContext,
    args: LaunchInstancesGcpArgs,
) -> Result<(), JobError> {
    let steps = env.steps();
    tracing::info!(
        zone = %args.zone,
        pubkey_id = args.pubkey_id,
        amount = args.detail.amount,
        "Processing launch instance GCP job"
    );

    let result = steps
        .run_step(&ctx, &launch_step(), || launch_instances(&env, &ctx, &args))
        .await;
    steps.finish_step(&ctx, &result).await;
    result?;

    let result = steps
        .run_step(&ctx, &describe_step(), || fetch_descriptions(&env, &ctx, &args))
        .await;
    steps.finish_step(&ctx, &result).await;
    result
}

fn gcp_client(
    env: &JobEnvironment,
    args: &LaunchInstancesGcpArgs,
) -> Result<Arc<dyn GcpClient>, JobError> {
    env.clouds()
        .gcp(&args.project_id)
        .job_context("cannot get gcp client")
}

async fn launch_instances(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesGcpArgs,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let pubkey = env
        .pubkeys()
        .get(ctx.account_id(), args.pubkey_id)
        .await
        .job_context("cannot get pubkey by id")?;

    let gcp = gcp_client(env, args)?;
    let params = GcpInstanceParams {
        image_name: args.image_name.clone(),
        machine_type: args.detail.machine_type.clone(),
        zone: args.zone.clone(),
        amount: args.detail.amount,
        name_pattern: args
            .detail
            .name_pattern
            .clone()
            .filter(|pattern| !pattern.is_empty())
            .unwrap_or_else(|| DEFAULT_NAME_PATTERN.to_string()),
        key_body: pubkey.body,
    };
    let launch = gcp
        .insert_instances(&params)
        .await
        .job_context("cannot run instances for gcp client")?;

    let store = env.reservations();
    for instance_id in &launch.instance_ids {
        store
            .create_instance(ctx.account_id(), Instance::new(ctx.reservation_id(), instance_id))
            .await
            .job_context(&format!("cannot create instance reservation for id {instance_id}"))?;
    }
    tracing::info!(
        operation = %launch.operation_name,
        instances = launch.instance_ids.len(),
        "Inserted GCP instances"
    );

    store
        .update_gcp_operation_name(ctx.account_id(), ctx.reservation_id(), launch.operation_name)
        .await
        .job_context("cannot update operation name for GCP")
}

async fn fetch_descriptions(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesGcpArgs,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let ids: Vec<String> = env
        .reservations()
        .list_instances(ctx.account_id(), ctx.reservation_id())
        .await
        .job_context("cannot get instances list")?
        .into_iter()
        .map(|instance| instance.instance_id)
        .collect();

    let gcp = gcp_client(env, args)?;
    let descriptions = wait_for_descriptions(env, ctx, || async {
        gcp.describe_instances(&args.zone, &ids)
            .await
            .job_context("cannot get list instances description")
    })
    .await?;

    save_descriptions(env, ctx, descriptions).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn name_pattern_is_optional_in_json() {
        let args: LaunchInstancesGcpArgs = serde_json::from_value(serde_json::json!({
            "account_id": 1,
            "reservation_id": 9,
            "zone": "us-east4-a",
            "pubkey_id": 3,
            "detail": {
                "zone": "us-east4-a",
                "machine_type": "e2-micro",
                "amount": 1,
                "name_pattern": null,
                "power_off": false
            },
            "image_name": "rhel-9",
            "project_id": {"payload": "project-1", "source_id": "2"}
        }))
        .unwrap();
        assert!(args.detail.name_pattern.is_none());
        assert_eq!(LaunchInstancesGcpArgs::JOB_TYPE, "launch_instances_gcp");
    }
}
