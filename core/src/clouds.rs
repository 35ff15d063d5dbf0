//! Narrow capability interfaces of the cloud provider collaborators.
//!
//! Job handlers only ever talk to providers through these traits. Wire-level protocol
//! details, pagination and SDK-level retries belong to the implementations, which live
//! outside this workspace; `provisioning-testing` ships recording stubs.
//!
//! Client construction goes through a [`CloudClients`] factory so a handler can be tested
//! against stubs and so per-request credentials (assumed roles, projects, subscriptions)
//! never leak into shared state.

use crate::pubkey::Pubkey;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Boxed future returned by the client traits.
pub type ClientFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClientError>> + Send + 'a>>;

/// Errors reported by cloud collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No key with the fingerprint exists in the provider region.
    #[error("pubkey not found")]
    PubkeyNotFound,

    /// A key with the same name already exists in the provider region.
    #[error("duplicate pubkey")]
    DuplicatePubkey,

    /// The credentials were rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The provider rejected the request.
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider is not consistent yet or the call hit a network blip.
    #[error("transient provider error: {0}")]
    Transient(String),
}

impl ClientError {
    /// Whether the same call may succeed when repeated later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Provider authentication resolved from a source, carried in job arguments.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Role ARN, GCP project id or Azure subscription id.
    pub payload: String,
    /// Source the authentication was resolved from.
    pub source_id: String,
}

impl Authentication {
    /// Authentication for `payload` resolved from `source_id`.
    #[must_use]
    pub fn new(payload: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            source_id: source_id.into(),
        }
    }
}

/// Temporary credentials returned by a role assumption.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Network details of one instance as reported by a provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    /// Provider instance id.
    pub id: String,
    /// Public DNS name.
    pub public_dns: Option<String>,
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
}

/// Parameters of an EC2 launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsInstanceParams {
    /// AMI id.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Key pair name.
    pub key_name: String,
    /// Instance count.
    pub amount: i32,
    /// Optional instance name.
    pub name: Option<String>,
}

/// Result of an EC2 launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AwsLaunch {
    /// Created instance ids.
    pub instance_ids: Vec<String>,
    /// Reservation id assigned by EC2.
    pub aws_reservation_id: String,
}

/// Parameters of a GCP bulk insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcpInstanceParams {
    /// Image name.
    pub image_name: String,
    /// Machine type.
    pub machine_type: String,
    /// Zone.
    pub zone: String,
    /// Instance count.
    pub amount: i32,
    /// Name pattern, `#` replaced by digits.
    pub name_pattern: String,
    /// Public key body installed on the instances.
    pub key_body: String,
}

/// Result of a GCP bulk insert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcpLaunch {
    /// Bulk insert operation name.
    pub operation_name: String,
    /// Created instance ids.
    pub instance_ids: Vec<String>,
}

/// An Azure resource group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceGroup {
    /// Resource id.
    pub id: String,
    /// Location the group lives in.
    pub location: String,
}

/// Parameters of an Azure VM batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AzureInstanceParams {
    /// Location.
    pub location: String,
    /// Resource group.
    pub resource_group: String,
    /// Image id.
    pub image_id: String,
    /// VM size.
    pub instance_size: String,
    /// Public key installed on the VMs.
    pub pubkey: Pubkey,
    /// VM count.
    pub amount: i32,
    /// VM name prefix.
    pub name: String,
}

/// Security token service.
pub trait StsClient: Send + Sync {
    /// Assume a cross-account role.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Unauthorized`] if the role cannot be assumed.
    fn assume_role<'a>(&'a self, arn: &'a str) -> ClientFuture<'a, Credentials>;
}

/// EC2 in one region.
pub trait Ec2Client: Send + Sync {
    /// Name of the key pair with the given fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PubkeyNotFound`] if no key matches.
    fn get_pubkey_name<'a>(&'a self, fingerprint: &'a str) -> ClientFuture<'a, String>;

    /// Import a key pair under `tag`, returning its handle.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::DuplicatePubkey`] if the key name is taken.
    fn import_pubkey<'a>(&'a self, pubkey: &'a Pubkey, tag: &'a str) -> ClientFuture<'a, String>;

    /// Launch instances.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the launch is rejected.
    fn run_instances<'a>(&'a self, params: &'a AwsInstanceParams) -> ClientFuture<'a, AwsLaunch>;

    /// Describe instances; an empty result means the details are not available yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the call is rejected.
    fn describe_instances<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ClientFuture<'a, Vec<InstanceDescription>>;
}

/// Compute API of one GCP project.
pub trait GcpClient: Send + Sync {
    /// Bulk insert instances.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the insert is rejected.
    fn insert_instances<'a>(&'a self, params: &'a GcpInstanceParams) -> ClientFuture<'a, GcpLaunch>;

    /// Describe instances in a zone; an empty result means not available yet.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the call is rejected.
    fn describe_instances<'a>(
        &'a self,
        zone: &'a str,
        instance_ids: &'a [String],
    ) -> ClientFuture<'a, Vec<InstanceDescription>>;
}

/// Resource manager and compute API of one Azure subscription.
pub trait AzureClient: Send + Sync {
    /// Create the resource group if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the group cannot be created.
    fn ensure_resource_group<'a>(
        &'a self,
        name: &'a str,
        location: &'a str,
    ) -> ClientFuture<'a, ResourceGroup>;

    /// Create VMs, returning their descriptions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the VMs cannot be created.
    fn create_vms<'a>(
        &'a self,
        params: &'a AzureInstanceParams,
    ) -> ClientFuture<'a, Vec<InstanceDescription>>;
}

/// Factory of provider clients.
pub trait CloudClients: Send + Sync {
    /// Security token service of the service account.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the client cannot be built.
    fn sts(&self) -> Result<Arc<dyn StsClient>, ClientError>;

    /// EC2 client acting with `credentials` in `region`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the client cannot be built.
    fn ec2(
        &self,
        credentials: &Credentials,
        region: &str,
    ) -> Result<Arc<dyn Ec2Client>, ClientError>;

    /// GCP client for the project in `auth`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the client cannot be built.
    fn gcp(&self, auth: &Authentication) -> Result<Arc<dyn GcpClient>, ClientError>;

    /// Azure client for the subscription in `auth`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Provider`] if the client cannot be built.
    fn azure(&self, auth: &Authentication) -> Result<Arc<dyn AzureClient>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_transient() {
        assert!(ClientError::Transient("throttled".to_string()).is_transient());
        assert!(!ClientError::PubkeyNotFound.is_transient());
        assert!(!ClientError::Provider("InvalidAMIID".to_string()).is_transient());
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let credentials = Credentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "token".to_string(),
        };
        let debug = format!("{credentials:?}");
        assert!(debug.contains("AKIA"));
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("token\""));
    }
}
