//! SSH public keys and their per-provider uploads.

use crate::reservation::{AccountId, ProviderType};
use serde::{Deserialize, Serialize};

/// An SSH public key owned by a tenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pubkey {
    /// Primary key.
    pub id: i64,
    /// Owning tenant.
    pub account_id: AccountId,
    /// User-facing key name, also used as the key pair name on import.
    pub name: String,
    /// Key body in `authorized_keys` format.
    pub body: String,
    /// Fingerprint used to look the key up on providers.
    pub fingerprint: String,
}

/// Record of a public key imported into a provider region.
///
/// The `tag` is random and not unique; together with the id it forms the name the key is
/// imported under, see [`PubkeyResource::formatted_tag`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubkeyResource {
    /// Primary key, `0` until persisted.
    pub id: i64,
    /// Key that was imported.
    pub pubkey_id: i64,
    /// Provider the key lives in.
    pub provider: ProviderType,
    /// Source the provider credentials came from.
    pub source_id: String,
    /// Provider region.
    pub region: String,
    /// Random tag.
    pub tag: String,
    /// Provider handle (key pair id).
    pub handle: String,
}

impl PubkeyResource {
    /// New, not yet persisted resource with an empty tag.
    #[must_use]
    pub fn new(
        pubkey_id: i64,
        provider: ProviderType,
        source_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            pubkey_id,
            provider,
            source_id: source_id.into(),
            region: region.into(),
            tag: String::new(),
            handle: String::new(),
        }
    }

    /// Whether the resource has been stored yet.
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        self.id != 0
    }

    /// Name safe for every cloud: starts with a letter, only alphanumerics and dashes.
    #[must_use]
    pub fn formatted_tag(&self) -> String {
        format!("pk-{}-{}", self.id, self.tag)
    }
}

/// A tenant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Primary key.
    pub id: AccountId,
    /// Organization id from the identity header.
    pub org_id: String,
    /// Legacy account number, may be empty.
    pub account_number: Option<String>,
}
