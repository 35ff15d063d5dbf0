//! `launch_instances_aws`: ensure the public key, launch instances, fetch their addresses.

use crate::describe::{save_descriptions, wait_for_descriptions};
use crate::{JobEnvironment, ResultExt};
use provisioning_core::clouds::{Authentication, AwsInstanceParams, ClientError, Ec2Client};
use provisioning_core::context::{JobContext, JobError};
use provisioning_core::pubkey::PubkeyResource;
use provisioning_core::registry::JobArgs;
use provisioning_core::reservation::{
    AccountId, AwsDetail, AwsReservationDetail, Instance, NewReservation, ProviderType,
    ReservationDetail, ReservationId,
};
use provisioning_core::store::StoreError;
use provisioning_runtime::Step;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const TAG_LENGTH: usize = 20;

/// Titles of the planned reservation steps.
pub const STEP_TITLES: [&str; 3] = [
    "Ensure public key",
    "Launch instance(s)",
    "Fetch instance(s) description",
];

/// Arguments of the `launch_instances_aws` job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInstancesAwsArgs {
    /// Tenant owning the reservation.
    pub account_id: AccountId,
    /// Reservation to advance.
    pub reservation_id: ReservationId,
    /// Region to launch into.
    pub region: String,
    /// Key to install on the instances.
    pub pubkey_id: i64,
    /// Source the role ARN was read from.
    pub source_id: String,
    /// Instance parameters.
    pub detail: AwsDetail,
    /// AMI to launch.
    pub image_id: String,
    /// Role to assume for every EC2 call.
    pub arn: Authentication,
}

impl JobArgs for LaunchInstancesAwsArgs {
    const JOB_TYPE: &'static str = "launch_instances_aws";

    fn account_id(&self) -> AccountId {
        self.account_id
    }

    fn reservation_id(&self) -> ReservationId {
        self.reservation_id
    }
}

/// Reservation planned for a `launch_instances_aws` job.
#[must_use]
pub fn new_reservation(account_id: AccountId, detail: AwsReservationDetail) -> NewReservation {
    NewReservation::new(account_id, 3, ReservationDetail::Aws(detail)).with_step_titles(STEP_TITLES)
}

fn ensure_pubkey_step() -> Step {
    Step::new("aws_pubkey", "Uploading public key", "Uploaded public key")
}

fn launch_step() -> Step {
    Step::new("aws_launch", "Launching instance(s)", "Launched instance(s)")
}

fn describe_step() -> Step {
    Step::new(
        "aws_describe",
        "Fetching instance(s) description",
        "Instance(s) description fetched",
    )
}

pub(crate) async fn handle(
    env: JobEnvironment,
    ctx: JobContext,
    args: LaunchInstancesAwsArgs,
) -> Result<(), JobError> {
    let steps = env.steps();
    tracing::info!(
        region = %args.region,
        pubkey_id = args.pubkey_id,
        amount = args.detail.amount,
        "Processing launch instance AWS job"
    );

    let result = steps
        .run_step(&ctx, &ensure_pubkey_step(), || ensure_pubkey(&env, &ctx, &args))
        .await;
    steps.finish_step(&ctx, &result).await;
    result?;

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

async fn ec2_client(
    env: &JobEnvironment,
    args: &LaunchInstancesAwsArgs,
) -> Result<Arc<dyn Ec2Client>, JobError> {
    let sts = env.clouds().sts().job_context("cannot create sts client")?;
    let credentials = sts
        .assume_role(&args.arn.payload)
        .await
        .job_context("cannot assume role")?;
    env.clouds()
        .ec2(&credentials, &args.region)
        .job_context("cannot create new ec2 client from config")
}

fn random_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TAG_LENGTH)
        .map(char::from)
        .collect()
}

async fn ensure_pubkey(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesAwsArgs,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let pubkey = env
        .pubkeys()
        .get(ctx.account_id(), args.pubkey_id)
        .await
        .job_context("cannot upload aws pubkey")?;

    let mut resource = match env
        .pubkeys()
        .get_resource(args.pubkey_id, args.source_id.clone(), args.region.clone())
        .await
    {
        Ok(resource) => resource,
        Err(StoreError::NotFound(_)) => {
            PubkeyResource::new(pubkey.id, ProviderType::Aws, &args.source_id, &args.region)
        }
        Err(e) => return Err(JobError::from(e).context("unable to check pubkey resource")),
    };

    let ec2 = ec2_client(env, args).await?;
    let key_name = match ec2.get_pubkey_name(&pubkey.fingerprint).await {
        Ok(name) => {
            tracing::debug!(
                fingerprint = %pubkey.fingerprint,
                key_name = %name,
                "Found pubkey by fingerprint"
            );
            name
        }
        Err(ClientError::PubkeyNotFound) => {
            resource.tag = random_tag();
            resource.handle = ec2
                .import_pubkey(&pubkey, &resource.formatted_tag())
                .await
                .map_err(|e| match e {
                    ClientError::DuplicatePubkey => JobError::from(e).context(&format!(
                        "key with fingerprint {} not found on AWS, but importing the key failed",
                        pubkey.fingerprint
                    )),
                    other => JobError::from(other).context("cannot upload aws pubkey"),
                })?;
            tracing::info!(handle = %resource.handle, "Imported pubkey to AWS");
            pubkey.name.clone()
        }
        Err(e) => {
            return Err(JobError::from(e).context(&format!(
                "cannot fetch name of pubkey with fingerprint ({})",
                pubkey.fingerprint
            )));
        }
    };

    env.reservations()
        .update_aws_pubkey_name(ctx.account_id(), ctx.reservation_id(), key_name)
        .await
        .job_context("failed to save AWS pubkey name to DB")?;

    if !resource.is_persisted() {
        env.pubkeys()
            .create_resource(resource)
            .await
            .job_context("cannot create resource for aws pubkey")?;
    }
    Ok(())
}

async fn launch_instances(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesAwsArgs,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let store = env.reservations();
    let detail = match store
        .get_detail(ctx.account_id(), ctx.reservation_id())
        .await
        .job_context("cannot get aws reservation by id")?
    {
        ReservationDetail::Aws(detail) => detail,
        other => {
            return Err(JobError::failed(format!(
                "cannot get aws reservation by id: reservation is a {} reservation",
                other.provider()
            )));
        }
    };
    let key_name = detail
        .detail
        .pubkey_name
        .ok_or_else(|| JobError::failed("cannot launch instances: pubkey name is not known yet"))?;

    let ec2 = ec2_client(env, args).await?;
    let params = AwsInstanceParams {
        image_id: args.image_id.clone(),
        instance_type: args.detail.instance_type.clone(),
        key_name,
        amount: args.detail.amount,
        name: args.detail.name.clone(),
    };
    tracing::trace!("Executing RunInstances");
    let launch = ec2
        .run_instances(&params)
        .await
        .job_context("cannot run instances")?;

    for instance_id in &launch.instance_ids {
        store
            .create_instance(ctx.account_id(), Instance::new(ctx.reservation_id(), instance_id))
            .await
            .job_context(&format!("cannot create instance reservation for id {instance_id}"))?;
        tracing::info!(
            instance_id = %instance_id,
            aws_reservation_id = %launch.aws_reservation_id,
            "Created new instance via AWS reservation"
        );
    }

    store
        .update_aws_reservation_id(
            ctx.account_id(),
            ctx.reservation_id(),
            launch.aws_reservation_id,
        )
        .await
        .job_context("cannot update aws reservation id")
}

async fn fetch_descriptions(
    env: &JobEnvironment,
    ctx: &JobContext,
    args: &LaunchInstancesAwsArgs,
) -> Result<(), JobError> {
    ctx.checkpoint()?;
    let store = env.reservations();
    let ids: Vec<String> = store
        .list_instances(ctx.account_id(), ctx.reservation_id())
        .await
        .job_context("cannot get instances list")?
        .into_iter()
        .map(|instance| instance.instance_id)
        .collect();

    let ec2 = ec2_client(env, args).await?;
    let descriptions = wait_for_descriptions(env, ctx, || async {
        ec2.describe_instances(&ids)
            .await
            .job_context("cannot get list instances description")
    })
    .await?;

    save_descriptions(env, ctx, descriptions).await
}
