//! Scriptable cloud clients.
//!
//! [`StubClouds`] hands out one client per provider, all backed by shared state, so a test
//! can script provider behavior up front and inspect every call afterwards.

use provisioning_core::clouds::{
    Authentication, AwsInstanceParams, AwsLaunch, AzureClient, AzureInstanceParams,
    ClientError, ClientFuture, CloudClients, Credentials, Ec2Client, GcpClient,
    GcpInstanceParams, GcpLaunch, InstanceDescription, ResourceGroup, StsClient,
};
use provisioning_core::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A call received by one of the stub clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudCall {
    /// `StsClient::assume_role`.
    AssumeRole {
        /// Role ARN.
        arn: String,
    },
    /// `CloudClients::ec2`.
    Ec2Session {
        /// Region the client is bound to.
        region: String,
    },
    /// `Ec2Client::import_pubkey`.
    ImportPubkey {
        /// Key pair name.
        tag: String,
        /// Fingerprint of the imported key.
        fingerprint: String,
    },
    /// `Ec2Client::run_instances`.
    RunInstances(AwsInstanceParams),
    /// `GcpClient::insert_instances`.
    InsertInstances(GcpInstanceParams),
    /// `AzureClient::ensure_resource_group`.
    EnsureResourceGroup {
        /// Group name.
        name: String,
        /// Requested location.
        location: String,
    },
    /// `AzureClient::create_vms`.
    CreateVms(AzureInstanceParams),
}

#[derive(Debug, Default)]
struct StubState {
    calls: Vec<CloudCall>,
    known_keys: HashMap<String, String>,
    duplicate_import: bool,
    launch_error: Option<ClientError>,
    undescribed_rounds: u32,
    describe_calls: u32,
    resource_group_location: Option<String>,
    launches: u32,
}

/// Scriptable [`CloudClients`].
///
/// # Example
///
/// ```
/// use provisioning_testing::StubClouds;
/// use provisioning_core::clouds::CloudClients;
///
/// let clouds = StubClouds::new().with_known_pubkey("SHA256:abc", "existing-key");
/// assert!(clouds.sts().is_ok());
/// assert!(clouds.calls().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct StubClouds {
    state: Arc<Mutex<StubState>>,
}

impl StubClouds {
    /// Clients where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// EC2 already knows a key pair with `fingerprint` under `name`.
    #[must_use]
    pub fn with_known_pubkey(
        self,
        fingerprint: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.lock().known_keys.insert(fingerprint.into(), name.into());
        self
    }

    /// Key imports fail with [`ClientError::DuplicatePubkey`].
    #[must_use]
    pub fn with_duplicate_import(self) -> Self {
        self.lock().duplicate_import = true;
        self
    }

    /// Instance launches on every provider fail with `error`.
    #[must_use]
    pub fn with_launch_error(self, error: ClientError) -> Self {
        self.lock().launch_error = Some(error);
        self
    }

    /// The first `rounds` describe calls return nothing.
    #[must_use]
    pub fn with_undescribed_rounds(self, rounds: u32) -> Self {
        self.lock().undescribed_rounds = rounds;
        self
    }

    /// Existing resource groups live in `location`.
    #[must_use]
    pub fn with_resource_group_location(self, location: impl Into<String>) -> Self {
        self.lock().resource_group_location = Some(location.into());
        self
    }

    /// Every call received so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    /// Number of describe calls received.
    #[must_use]
    pub fn describe_calls(&self) -> u32 {
        self.lock().describe_calls
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        lock(&self.state)
    }

    fn provider(&self) -> Arc<StubProvider> {
        Arc::new(StubProvider {
            state: Arc::clone(&self.state),
        })
    }
}

impl CloudClients for StubClouds {
    fn sts(&self) -> Result<Arc<dyn StsClient>, ClientError> {
        Ok(self.provider())
    }

    fn ec2(
        &self,
        _credentials: &Credentials,
        region: &str,
    ) -> Result<Arc<dyn Ec2Client>, ClientError> {
        self.lock().calls.push(CloudCall::Ec2Session {
            region: region.to_string(),
        });
        Ok(self.provider())
    }

    fn gcp(&self, _auth: &Authentication) -> Result<Arc<dyn GcpClient>, ClientError> {
        Ok(self.provider())
    }

    fn azure(&self, _auth: &Authentication) -> Result<Arc<dyn AzureClient>, ClientError> {
        Ok(self.provider())
    }
}

fn lock(state: &Mutex<StubState>) -> MutexGuard<'_, StubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StubProvider {
    state: Arc<Mutex<StubState>>,
}

impl StubProvider {
    fn launch(&self, call: CloudCall) -> Result<u32, ClientError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if let Some(error) = state.launch_error.clone() {
            return Err(error);
        }
        state.launches += 1;
        Ok(state.launches)
    }

    fn describe(&self, ids: &[String]) -> Vec<InstanceDescription> {
        let mut state = lock(&self.state);
        state.describe_calls += 1;
        if state.undescribed_rounds > 0 {
            state.undescribed_rounds -= 1;
            return Vec::new();
        }
        ids.iter()
            .enumerate()
            .map(|(i, id)| InstanceDescription {
                id: id.clone(),
                public_dns: Some(format!("{id}.compute.example.com")),
                public_ipv4: Some(format!("10.0.0.{}", i + 1)),
            })
            .collect()
    }
}

impl StsClient for StubProvider {
    fn assume_role<'a>(&'a self, arn: &'a str) -> ClientFuture<'a, Credentials> {
        Box::pin(async move {
            lock(&self.state).calls.push(CloudCall::AssumeRole {
                arn: arn.to_string(),
            });
            if arn.is_empty() {
                return Err(ClientError::Unauthorized("empty role arn".to_string()));
            }
            Ok(Credentials {
                access_key_id: "AKIASTUB".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: "session".to_string(),
            })
        })
    }
}

impl Ec2Client for StubProvider {
    fn get_pubkey_name<'a>(&'a self, fingerprint: &'a str) -> ClientFuture<'a, String> {
        Box::pin(async move {
            lock(&self.state)
                .known_keys
                .get(fingerprint)
                .cloned()
                .ok_or(ClientError::PubkeyNotFound)
        })
    }

    fn import_pubkey<'a>(&'a self, pubkey: &'a Pubkey, tag: &'a str) -> ClientFuture<'a, String> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.calls.push(CloudCall::ImportPubkey {
                tag: tag.to_string(),
                fingerprint: pubkey.fingerprint.clone(),
            });
            if state.duplicate_import {
                return Err(ClientError::DuplicatePubkey);
            }
            state
                .known_keys
                .insert(pubkey.fingerprint.clone(), pubkey.name.clone());
            Ok(format!("key-{}", pubkey.id))
        })
    }

    fn run_instances<'a>(&'a self, params: &'a AwsInstanceParams) -> ClientFuture<'a, AwsLaunch> {
        Box::pin(async move {
            let launch = self.launch(CloudCall::RunInstances(params.clone()))?;
            Ok(AwsLaunch {
                instance_ids: (0..params.amount)
                    .map(|i| format!("i-{launch:04}{i:04}"))
                    .collect(),
                aws_reservation_id: format!("r-{launch:08}"),
            })
        })
    }

    fn describe_instances<'a>(
        &'a self,
        instance_ids: &'a [String],
    ) -> ClientFuture<'a, Vec<InstanceDescription>> {
        Box::pin(async move { Ok(self.describe(instance_ids)) })
    }
}

impl GcpClient for StubProvider {
    fn insert_instances<'a>(
        &'a self,
        params: &'a GcpInstanceParams,
    ) -> ClientFuture<'a, GcpLaunch> {
        Box::pin(async move {
            let launch = self.launch(CloudCall::InsertInstances(params.clone()))?;
            Ok(GcpLaunch {
                operation_name: format!("operation-{launch}"),
                instance_ids: (0..params.amount)
                    .map(|i| format!("{launch}{i:03}"))
                    .collect(),
            })
        })
    }

    fn describe_instances<'a>(
        &'a self,
        _zone: &'a str,
        instance_ids: &'a [String],
    ) -> ClientFuture<'a, Vec<InstanceDescription>> {
        Box::pin(async move { Ok(self.describe(instance_ids)) })
    }
}

impl AzureClient for StubProvider {
    fn ensure_resource_group<'a>(
        &'a self,
        name: &'a str,
        location: &'a str,
    ) -> ClientFuture<'a, ResourceGroup> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.calls.push(CloudCall::EnsureResourceGroup {
                name: name.to_string(),
                location: location.to_string(),
            });
            Ok(ResourceGroup {
                id: format!("/subscriptions/stub/resourceGroups/{name}"),
                location: state
                    .resource_group_location
                    .clone()
                    .unwrap_or_else(|| location.to_string()),
            })
        })
    }

    fn create_vms<'a>(
        &'a self,
        params: &'a AzureInstanceParams,
    ) -> ClientFuture<'a, Vec<InstanceDescription>> {
        Box::pin(async move {
            self.launch(CloudCall::CreateVms(params.clone()))?;
            Ok((0..params.amount)
                .map(|i| InstanceDescription {
                    id: format!(
                        "/subscriptions/stub/resourceGroups/{}/providers/Microsoft.Compute/virtualMachines/{}-{i}",
                        params.resource_group, params.name
                    ),
                    public_dns: None,
                    public_ipv4: Some(format!("20.0.0.{}", i + 1)),
                })
                .collect())
        })
    }
}
