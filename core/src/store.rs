//! Persistence traits for reservations, public keys and accounts.
//!
//! Every reservation operation is scoped by an explicit [`AccountId`]: a reservation id
//! that belongs to another tenant behaves exactly like a missing one.
//!
//! # Implementations
//!
//! - `PostgresReservationStore` (in `provisioning-postgres`): production storage
//! - `InMemoryReservationStore` (in `provisioning-testing`): fast, deterministic tests
//!
//! # Dyn Compatibility
//!
//! Like the queue trait, these traits return `Pin<Box<dyn Future>>` instead of using
//! `async fn` so they can be shared as `Arc<dyn ReservationStore>` between the dequeue
//! loop, the step orchestration helpers and the job handlers.

use crate::pubkey::{Account, Pubkey, PubkeyResource};
use crate::reservation::{
    AccountId, Instance, InstanceDetail, NewReservation, Reservation, ReservationDetail,
    ReservationId, StatusUpdate,
};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the store traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No row matched the id within the tenant.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A statement changed a different number of rows than expected.
    #[error("Expected {expected} affected row(s), got {actual}")]
    AffectedMismatch {
        /// Expected row count.
        expected: u64,
        /// Actual row count.
        actual: u64,
    },

    /// A unique constraint was violated, typically by a concurrent first insert.
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// The detail row has a different provider than the operation expects.
    #[error("Provider mismatch for reservation {reservation_id}: expected {expected}")]
    ProviderMismatch {
        /// Reservation that was accessed.
        reservation_id: ReservationId,
        /// Provider the operation needs.
        expected: &'static str,
    },

    /// Database connection or query failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Unique violations are the race of two concurrent first inserts: the retry will
    /// find the row the other writer created.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

/// Durable reservation storage.
///
/// Mutations are narrow, single-statement updates so that concurrent jobs for different
/// reservations never contend, and the step counter of one reservation can only move
/// forward.
pub trait ReservationStore: Send + Sync {
    /// Create a reservation together with its provider detail row in one transaction.
    ///
    /// The reservation starts with status `"Created"`, `step = 0` and no outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if either insert fails; nothing is persisted then.
    fn create(&self, reservation: NewReservation) -> StoreFuture<'_, Reservation>;

    /// Load a reservation of the given tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id does not exist within the tenant.
    fn get(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, Reservation>;

    /// Load the provider detail row of a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id does not exist within the tenant.
    fn get_detail(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, ReservationDetail>;

    /// List reservations of a tenant ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn list(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> StoreFuture<'_, Vec<Reservation>>;

    /// Overwrite the status and advance the step counter in one statement.
    ///
    /// The counter grows by `update.add_steps`, never beyond `steps`, and only the first
    /// time a given `step_key` is applied. Re-applying a key rewrites the status only, so a
    /// step re-executed after a lease expiry cannot be counted twice.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AffectedMismatch`] if no reservation matched.
    fn update_status(
        &self,
        account_id: AccountId,
        id: ReservationId,
        update: StatusUpdate,
    ) -> StoreFuture<'_, ()>;

    /// Mark the reservation successful if all steps are done and it is still in flight.
    ///
    /// Returns `true` when this call performed the terminal transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn finish_with_success(&self, account_id: AccountId, id: ReservationId)
    -> StoreFuture<'_, bool>;

    /// Mark the reservation failed with `message` if it is still in flight.
    ///
    /// Returns `true` when this call performed the terminal transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    fn finish_with_error(
        &self,
        account_id: AccountId,
        id: ReservationId,
        message: String,
    ) -> StoreFuture<'_, bool>;

    /// Store the name of the key pair used on EC2.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ProviderMismatch`] for non-AWS reservations.
    fn update_aws_pubkey_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        pubkey_name: String,
    ) -> StoreFuture<'_, ()>;

    /// Store the reservation id EC2 assigned to the launch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ProviderMismatch`] for non-AWS reservations.
    fn update_aws_reservation_id(
        &self,
        account_id: AccountId,
        id: ReservationId,
        aws_reservation_id: String,
    ) -> StoreFuture<'_, ()>;

    /// Store the bulk-insert operation name GCP assigned to the launch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ProviderMismatch`] for non-GCP reservations.
    fn update_gcp_operation_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        operation_name: String,
    ) -> StoreFuture<'_, ()>;

    /// Store the location resolved from the Azure resource group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ProviderMismatch`] for non-Azure reservations.
    fn update_azure_location(
        &self,
        account_id: AccountId,
        id: ReservationId,
        location: String,
    ) -> StoreFuture<'_, ()>;

    /// Record an instance created for a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the reservation does not exist within the tenant.
    fn create_instance(&self, account_id: AccountId, instance: Instance) -> StoreFuture<'_, ()>;

    /// List instances of a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    fn list_instances(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, Vec<Instance>>;

    /// Attach network details to an instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AffectedMismatch`] if the instance is unknown.
    fn update_instance_description(
        &self,
        account_id: AccountId,
        id: ReservationId,
        instance_id: String,
        detail: InstanceDetail,
    ) -> StoreFuture<'_, ()>;

    /// Delete a reservation with its detail and instance rows. Administrative use only.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AffectedMismatch`] if no reservation matched.
    fn delete(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, ()>;
}

/// Public key storage.
pub trait PubkeyStore: Send + Sync {
    /// Load a key of the given tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key does not exist within the tenant.
    fn get(&self, account_id: AccountId, id: i64) -> StoreFuture<'_, Pubkey>;

    /// Find the upload record of a key for a source and region.
    ///
    /// Unscoped: callers must have loaded the key through [`PubkeyStore::get`] first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the key was never uploaded there.
    fn get_resource(
        &self,
        pubkey_id: i64,
        source_id: String,
        region: String,
    ) -> StoreFuture<'_, PubkeyResource>;

    /// Persist an upload record, returning it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    fn create_resource(&self, resource: PubkeyResource) -> StoreFuture<'_, PubkeyResource>;
}

/// Tenant storage.
pub trait AccountStore: Send + Sync {
    /// Load the account of an organization, creating it on first use.
    ///
    /// Two concurrent first calls race on the unique organization id; the loser sees
    /// [`StoreError::UniqueViolation`], which callers retry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UniqueViolation`] on the insert race, [`StoreError::Database`]
    /// otherwise.
    fn get_or_create(
        &self,
        org_id: String,
        account_number: Option<String>,
    ) -> StoreFuture<'_, Account>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_transient() {
        assert!(StoreError::UniqueViolation("accounts_org_id_key".to_string()).is_transient());
        assert!(!StoreError::NotFound("reservation 1".to_string()).is_transient());
    }

    #[test]
    fn affected_mismatch_display() {
        let error = StoreError::AffectedMismatch {
            expected: 1,
            actual: 0,
        };
        assert_eq!(error.to_string(), "Expected 1 affected row(s), got 0");
    }
}
