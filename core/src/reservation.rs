//! Reservation model: a provisioning request and its multi-step progress.
//!
//! A [`Reservation`] is created together with its provider-specific detail row
//! ([`ReservationDetail`]) and from then on is only mutated by the step orchestration
//! helpers in the runtime crate. The externally observable progress consists of:
//!
//! - `step` / `steps`: completed and planned step counts (`0 <= step <= steps`)
//! - `status`: free-text marker, overwritten on every transition
//! - `success`: `None` while in flight, then `Some(true)` or `Some(false)` exactly once
//! - `error`: failure message, only set when `success == Some(false)`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Status every reservation starts with.
pub const STATUS_CREATED: &str = "Created";

/// Status forced on a step whose job exceeded its deadline.
pub const STATUS_TIMEOUT: &str = "Timeout";

/// Identifier of the tenant owning a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Wrap a raw account id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value, as stored in the database.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable identifier of a reservation, assigned at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(i64);

impl ReservationId {
    /// Wrap a raw reservation id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw value, as stored in the database.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when parsing an unknown provider name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown provider type: {0}")]
pub struct ParseProviderError(String);

/// Cloud provider a reservation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// No provider, used by the no-operation jobs.
    Noop,
    /// Amazon Web Services.
    Aws,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
}

impl ProviderType {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = ParseProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "noop" => Ok(Self::Noop),
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(ParseProviderError(other.to_string())),
        }
    }
}

/// A provisioning request and its progress.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Durable identifier.
    pub id: ReservationId,
    /// Target provider, derived from the detail row.
    pub provider: ProviderType,
    /// Owning tenant.
    pub account_id: AccountId,
    /// Total number of steps planned at creation.
    pub steps: i32,
    /// Number of steps completed so far.
    pub step: i32,
    /// Human readable titles of the planned steps.
    pub step_titles: Vec<String>,
    /// Latest progress marker.
    pub status: String,
    /// Terminal outcome, `None` while the reservation is in flight.
    pub success: Option<bool>,
    /// Failure message, empty unless `success == Some(false)`.
    pub error: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the terminal state was reached.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// Whether the reservation reached a terminal state.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.success.is_some()
    }

    /// Whether every planned step has been completed.
    #[must_use]
    pub const fn all_steps_done(&self) -> bool {
        self.step >= self.steps
    }
}

/// AWS launch parameters stored with the reservation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsDetail {
    /// Region to launch into.
    pub region: String,
    /// EC2 instance type.
    pub instance_type: String,
    /// Number of instances.
    pub amount: i32,
    /// Optional instance name.
    pub name: Option<String>,
    /// Power the instance off after provisioning.
    pub power_off: bool,
    /// Name of the key pair on EC2, filled in by the pubkey step.
    pub pubkey_name: Option<String>,
}

/// Detail row of an AWS reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsReservationDetail {
    /// Public key used for the instances.
    pub pubkey_id: i64,
    /// Source (cloud account link) the credentials come from.
    pub source_id: String,
    /// AMI to launch.
    pub image_id: String,
    /// Reservation id assigned by EC2, filled in by the launch step.
    pub aws_reservation_id: Option<String>,
    /// Launch parameters.
    pub detail: AwsDetail,
}

/// GCP launch parameters stored with the reservation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpDetail {
    /// Zone to launch into.
    pub zone: String,
    /// Machine type.
    pub machine_type: String,
    /// Number of instances.
    pub amount: i32,
    /// Optional name pattern.
    pub name_pattern: Option<String>,
    /// Power the instance off after provisioning.
    pub power_off: bool,
}

/// Detail row of a GCP reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpReservationDetail {
    /// Public key used for the instances.
    pub pubkey_id: i64,
    /// Source (cloud account link) the project comes from.
    pub source_id: String,
    /// Image name.
    pub image_id: String,
    /// Bulk insert operation name assigned by GCP.
    pub gcp_operation_name: Option<String>,
    /// Launch parameters.
    pub detail: GcpDetail,
}

/// Azure launch parameters stored with the reservation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureDetail {
    /// Location (region) to launch into, may carry an availability zone suffix.
    pub location: String,
    /// VM size.
    pub instance_size: String,
    /// Number of instances.
    pub amount: i32,
    /// Optional VM name.
    pub name: Option<String>,
    /// Power the instance off after provisioning.
    pub power_off: bool,
}

/// Detail row of an Azure reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureReservationDetail {
    /// Public key used for the instances.
    pub pubkey_id: i64,
    /// Source (cloud account link) the subscription comes from.
    pub source_id: String,
    /// Image id.
    pub image_id: String,
    /// Launch parameters.
    pub detail: AzureDetail,
}

/// Provider-specific detail, created in the same transaction as the reservation.
///
/// The provider of a reservation is derived from this value, so a reservation can never
/// be created without its detail row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ReservationDetail {
    /// No-operation reservation (no detail payload).
    Noop,
    /// AWS detail row.
    Aws(AwsReservationDetail),
    /// GCP detail row.
    Gcp(GcpReservationDetail),
    /// Azure detail row.
    Azure(AzureReservationDetail),
}

impl ReservationDetail {
    /// Provider matching the detail variant.
    #[must_use]
    pub const fn provider(&self) -> ProviderType {
        match self {
            Self::Noop => ProviderType::Noop,
            Self::Aws(_) => ProviderType::Aws,
            Self::Gcp(_) => ProviderType::Gcp,
            Self::Azure(_) => ProviderType::Azure,
        }
    }

    /// Public key referenced by the detail, if any.
    #[must_use]
    pub const fn pubkey_id(&self) -> Option<i64> {
        match self {
            Self::Noop => None,
            Self::Aws(d) => Some(d.pubkey_id),
            Self::Gcp(d) => Some(d.pubkey_id),
            Self::Azure(d) => Some(d.pubkey_id),
        }
    }
}

/// Input for [`ReservationStore::create`](crate::store::ReservationStore::create).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewReservation {
    /// Owning tenant.
    pub account_id: AccountId,
    /// Planned step count.
    pub steps: i32,
    /// Titles of the planned steps.
    pub step_titles: Vec<String>,
    /// Provider detail row.
    pub detail: ReservationDetail,
}

impl NewReservation {
    /// New reservation with one untitled entry per step.
    #[must_use]
    pub fn new(account_id: AccountId, steps: i32, detail: ReservationDetail) -> Self {
        Self {
            account_id,
            steps,
            step_titles: Vec::new(),
            detail,
        }
    }

    /// Attach step titles.
    #[must_use]
    pub fn with_step_titles(mut self, titles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.step_titles = titles.into_iter().map(Into::into).collect();
        self
    }
}

/// A status transition applied by the step orchestration helpers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    /// New status text.
    pub status: String,
    /// Number of completed steps to add (0 for "before" updates).
    pub add_steps: i32,
    /// Idempotency key of the step; a key is counted at most once per reservation.
    pub step_key: Option<String>,
}

impl StatusUpdate {
    /// Status-only update, the step counter is left alone.
    #[must_use]
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            add_steps: 0,
            step_key: None,
        }
    }

    /// Status update that also completes `add_steps` steps under `step_key`.
    #[must_use]
    pub fn completed(
        status: impl Into<String>,
        add_steps: i32,
        step_key: impl Into<String>,
    ) -> Self {
        Self {
            status: status.into(),
            add_steps,
            step_key: Some(step_key.into()),
        }
    }
}

/// Network details of a launched instance, filled in by reconciliation steps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetail {
    /// Public IPv4 address.
    pub public_ipv4: Option<String>,
    /// Public DNS name.
    pub public_dns: Option<String>,
}

/// One concrete cloud instance created for a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Owning reservation.
    pub reservation_id: ReservationId,
    /// Provider-assigned instance identifier.
    pub instance_id: String,
    /// Details, empty until described.
    pub detail: InstanceDetail,
}

impl Instance {
    /// New instance row without details.
    #[must_use]
    pub fn new(reservation_id: ReservationId, instance_id: impl Into<String>) -> Self {
        Self {
            reservation_id,
            instance_id: instance_id.into(),
            detail: InstanceDetail::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_type_roundtrip() {
        for provider in [
            ProviderType::Noop,
            ProviderType::Aws,
            ProviderType::Gcp,
            ProviderType::Azure,
        ] {
            assert_eq!(provider.as_str().parse::<ProviderType>(), Ok(provider));
        }
    }

    #[test]
    fn provider_type_invalid() {
        assert!("openstack".parse::<ProviderType>().is_err());
    }

    #[test]
    fn detail_determines_provider() {
        let detail = ReservationDetail::Gcp(GcpReservationDetail {
            pubkey_id: 7,
            source_id: "1".to_string(),
            image_id: "rhel-9".to_string(),
            gcp_operation_name: None,
            detail: GcpDetail::default(),
        });
        assert_eq!(detail.provider(), ProviderType::Gcp);
        assert_eq!(detail.pubkey_id(), Some(7));
        assert_eq!(ReservationDetail::Noop.pubkey_id(), None);
    }

    #[test]
    fn status_update_constructors() {
        let before = StatusUpdate::status("Launching instance(s)");
        assert_eq!(before.add_steps, 0);
        assert!(before.step_key.is_none());

        let after = StatusUpdate::completed("Launched instance(s)", 1, "launch");
        assert_eq!(after.add_steps, 1);
        assert_eq!(after.step_key.as_deref(), Some("launch"));
    }
}
