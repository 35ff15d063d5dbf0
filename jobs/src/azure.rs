//! `launch_instances_azure`: ensure the resource group, then create the virtual machines.

use crate::{JobEnvironment, ResultExt};
use provisioning_core::clouds::{Authentication, AzureClient, AzureInstanceParams};
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::registry::JobArgs;
use provisioning_core::reservation::{
    AccountId, AzureReservationDetail, Instance, InstanceDetail, NewReservation,
    ReservationDetail, ReservationId,
};
use provisioning_runtime::Step;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Resource group used when the request names none.
pub const DEFAULT_RESOURCE_GROUP: &str = "redhat-deployed";

/// Location a missing resource group is created in when the request names none.
pub const DEFAULT_LOCATION: &str = "eastus";

/// VM name prefix used when the request names none.
pub const DEFAULT_VM_NAME: &str = "redhat-vm";

/// Titles of the planned reservation steps.
pub const STEP_TITLES: [&str; 2] = ["Prepare resource group", "Launch instance(s)"];

/// Arguments of the `launch_instances_azure` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInstancesAzureArgs {
    /// Tenant owning the reservation.
    pub account_id: AccountId,
    /// Reservation to advance.
    pub reservation_id: ReservationId,
    /// Region, optionally with an availability zone suffix; empty means the group's region.
    #[serde(default)]
    pub location: String,
    /// Key to install on the machines.
    pub pubkey_id: i64,
    /// Source the subscription was read from.
    pub source_id: String,
    /// Image to launch.
    pub image_id: String,
    /// Resource group to launch into.
    #[serde(default)]
    pub resource_group: String,
    /// Subscription to bill.
    pub subscription: Authentication,
    /// VM name prefix.
    #[serde(default)]
    pub name: String,
}

impl JobArgs for LaunchInstancesAzureArgs {
    const JOB_TYPE: &'static str = "launch_instances_azure";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

impl LaunchInstancesAzureArgs {
    /// Fill in defaults and drop an availability zone suffix from the location.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.resource_group.is_empty() {
            tracing::debug!(
                "Resource group has not been set, defaulting to '{DEFAULT_RESOURCE_GROUP}'"
            );
            self.resource_group = DEFAULT_RESOURCE_GROUP.to_string();
        }
        self.location = strip_zone(&self.location).to_string();
        if self.name.is_empty() {
            self.name = DEFAULT_VM_NAME.to_string();
        }
        self
    }
}

/// `"eastus_1"` becomes `"eastus"`; zones `_1` to `_6` are recognized.
#[must_use]
pub fn strip_zone(location: &str) -> &str {
    match location.as_bytes() {
        [.., b'_', zone] if (b'1'..=b'6').contains(zone) => &location[..location.len() - 2],
        _ => location,
    }
}

/// Reservation planned for a `launch_instances_azure` job.
#[must_use]
pub fn new_reservation(account_id: AccountId, detail: AzureReservationDetail) -> NewReservation {
    NewReservation::new(account_id, 2, ReservationDetail::Azure(detail))
        .with_step_titles(STEP_TITLES)
}

fn resource_group_step() -> Step {
    Step::new(
        "azure_resource_group",
        "Ensuring resource group presence",
        "Ensured resource group presence",
    )
}

fn launch_step() -> Step {
    Step::new("azure_launch", "Launching instance(s)", "Launched instance(s)")
}

pub(crate) async fn handle(
    env: JobEnvironment,
    ctx: JobContext,
    args: LaunchInstancesAzureArgs,
) -> Result<(), JobError> {
    let args = args.normalized();
    let steps = env.steps();
    tracing::info!(
        resource_group = %args.resource_group,
        location = %args.location,
        pubkey_id = args.pubkey_id,
        source_id = %args.source_id,
        "Started launch instance Azure job"
    );

    let result = steps
        .run_step(&ctx, &resource_group_step(), || {
            ensure_resource_group(&env, &ctx, &args)
        })
        .await;
    let finished = result.as_ref().map(|_| ()).map_err(Clone::clone);
    steps.finish_step(&ctx, &finished).await;
    let location = result?;

    let result = steps
        .run_step(&ctx, &launch_step(), || {
            launch_instances(&env, &ctx, &args, &location)
        })
        .await;
    steps.finish_step(&ctx, &result).await;
    result
}

fn azure_client(
    env: &JobEnvironment,
    args: &LaunchInstancesAzureArgs,
) -> Result<Arc<dyn AzureClient>, JobError> {
    env.clouds()
        .azure(&args.subscription)
        .job_context("cannot create new Azure client")
}

/// Returns the location to launch into.
async fn ensure_resource_group(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesAzureArgs,
) -> Result<String, JobError> {
    ctx.checkpoint()?;
    let azure = azure_client(env, args)?;
    let requested = if args.location.is_empty() {
        DEFAULT_LOCATION
    } else {
        args.location.as_str()
    };
    let group = azure
        .ensure_resource_group(&args.resource_group, requested)
        .await
        .job_context("failed to ensure resource group")?;
    tracing::trace!(resource_group_id = %group.id, "Using resource group");

    if !args.location.is_empty() {
        return Ok(args.location.clone());
    }

    tracing::debug!(azure_location = %group.location, "Using location from Resource Group");
    env.reservations()
        .update_azure_location(ctx.account_id(), ctx.reservation_id(), group.location.clone())
        .await
        .job_context("cannot save azure location")?;
    Ok(group.location)
}

async fn launch_instances(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesAzureArgs,
    location: &str,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let pubkey = env
        .pubkeys()
        .get(ctx.account_id(), args.pubkey_id)
        .await
        .job_context("cannot get public key by id")?;

    let store = env.reservations();
    let detail = match store
        .get_detail(ctx.account_id(), ctx.reservation_id())
        .await
        .job_context("cannot get azure reservation by id")?
    {
        ReservationDetail::Azure(detail) => detail.detail,
        other => {
            return Err(JobError::failed(format!(
                "cannot get azure reservation by id: reservation is a {} reservation",
                other.provider()
            )));
        }
    };

    let azure = azure_client(env, args)?;
    let params = AzureInstanceParams {
        location: location.to_string(),
        resource_group: args.resource_group.clone(),
        image_id: args.image_id.clone(),
        instance_size: detail.instance_size,
        pubkey,
        amount: detail.amount,
        name: args.name.clone(),
    };
    let created = azure
        .create_vms(&params)
        .await
        .job_context("cannot create Azure instance")?;

    for vm in created {
        let instance = Instance {
            reservation_id: ctx.reservation_id(),
            detail: InstanceDetail {
                public_ipv4: vm.public_ipv4,
                public_dns: vm.public_dns,
            },
            instance_id: vm.id,
        };
        let instance_id = instance.instance_id.clone();
        store
            .create_instance(ctx.account_id(), instance)
            .await
            .job_context(&format!("cannot create instance reservation for id {instance_id}"))?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn zone_suffix_is_stripped() {
        assert_eq!(strip_zone("eastus_1"), "eastus");
        assert_eq!(strip_zone("westeurope_6"), "westeurope");
        assert_eq!(strip_zone("eastus_7"), "eastus_7");
        assert_eq!(strip_zone("eastus"), "eastus");
        assert_eq!(strip_zone("_2"), "");
        assert_eq!(strip_zone(""), "");
    }

    #[test]
    fn defaults_fill_blank_arguments() {
        let args: LaunchInstancesAzureArgs = serde_json::from_value(serde_json::json!({
            "account_id": 1,
            "reservation_id": 4,
            "location": "eastus_2",
            "pubkey_id": 3,
            "source_id": "1",
            "image_id": "/subscriptions/x/images/rhel",
            "subscription": {"payload": "sub-1", "source_id": "1"}
        }))
        .unwrap();
        let args = args.normalized();

        assert_eq!(args.resource_group, DEFAULT_RESOURCE_GROUP);
        assert_eq!(args.location, "eastus");
        assert_eq!(args.name, DEFAULT_VM_NAME);
    }
}
