//! In-memory store implementations.
//!
//! Behave like the Postgres stores statement for statement (tenant scoping, the capped and
//! keyed step counter, single terminal transition) so handler tests observe the same
//! reservation rows production would.

use chrono::{DateTime, Utc};
use provisioning_core::environment::Clock;
use provisioning_core::pubkey::{Account, Pubkey, PubkeyResource};
use provisioning_core::reservation::{
    AccountId, Instance, InstanceDetail, NewReservation, Reservation, ReservationDetail,
    ReservationId, STATUS_CREATED, StatusUpdate,
};
use provisioning_core::store::{
    AccountStore, PubkeyStore, ReservationStore, StoreError, StoreFuture,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn no_rows() -> StoreError {
    StoreError::AffectedMismatch {
        expected: 1,
        actual: 0,
    }
}

#[derive(Debug)]
struct Row {
    reservation: Reservation,
    detail: ReservationDetail,
    applied_steps: HashSet<String>,
}

#[derive(Debug, Default)]
struct ReservationState {
    next_id: i64,
    rows: BTreeMap<ReservationId, Row>,
    instances: Vec<Instance>,
    reject_updates: bool,
}

impl ReservationState {
    fn row(&self, account_id: AccountId, id: ReservationId) -> Option<&Row> {
        self.rows
            .get(&id)
            .filter(|row| row.reservation.account_id == account_id)
    }

    fn row_mut(&mut self, account_id: AccountId, id: ReservationId) -> Option<&mut Row> {
        self.rows
            .get_mut(&id)
            .filter(|row| row.reservation.account_id == account_id)
    }
}

/// In-memory [`ReservationStore`].
///
/// # Example
///
/// ```
/// use provisioning_testing::{InMemoryReservationStore, test_clock};
/// use provisioning_core::reservation::{AccountId, NewReservation, ReservationDetail};
/// use provisioning_core::store::ReservationStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryReservationStore::new(test_clock());
/// let reservation = store
///     .create(NewReservation::new(AccountId::new(1), 1, ReservationDetail::Noop))
///     .await?;
/// assert_eq!(reservation.status, "Created");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryReservationStore {
    state: Arc<Mutex<ReservationState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReservationStore {
    /// Empty store stamping rows with `clock`.
    #[must_use]
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(ReservationState {
                next_id: 1,
                ..ReservationState::default()
            })),
            clock: Arc::new(clock),
        }
    }

    /// Make every following status update fail (or succeed again).
    pub fn reject_updates(&self, reject: bool) {
        lock(&self.state).reject_updates = reject;
    }

    /// Snapshot of a reservation regardless of tenant.
    #[must_use]
    pub fn snapshot(&self, id: ReservationId) -> Option<Reservation> {
        lock(&self.state)
            .rows
            .get(&id)
            .map(|row| row.reservation.clone())
    }

    /// Snapshot of a detail row regardless of tenant.
    #[must_use]
    pub fn detail_snapshot(&self, id: ReservationId) -> Option<ReservationDetail> {
        lock(&self.state).rows.get(&id).map(|row| row.detail.clone())
    }

    /// Number of stored reservations.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).rows.is_empty()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl std::fmt::Debug for InMemoryReservationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryReservationStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn create(&self, reservation: NewReservation) -> StoreFuture<'_, Reservation> {
        Box::pin(async move {
            let created_at = self.now();
            let mut state = lock(&self.state);
            let id = ReservationId::new(state.next_id);
            state.next_id += 1;

            let record = Reservation {
                id,
                provider: reservation.detail.provider(),
                account_id: reservation.account_id,
                steps: reservation.steps,
                step: 0,
                step_titles: reservation.step_titles,
                status: STATUS_CREATED.to_string(),
                success: None,
                error: String::new(),
                created_at,
                finished_at: None,
            };
            state.rows.insert(
                id,
                Row {
                    reservation: record.clone(),
                    detail: reservation.detail,
                    applied_steps: HashSet::new(),
                },
            );
            Ok(record)
        })
    }

    fn get(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, Reservation> {
        Box::pin(async move {
            lock(&self.state)
                .row(account_id, id)
                .map(|row| row.reservation.clone())
                .ok_or_else(|| StoreError::NotFound(format!("reservation {id}")))
        })
    }

    fn get_detail(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, ReservationDetail> {
        Box::pin(async move {
            lock(&self.state)
                .row(account_id, id)
                .map(|row| row.detail.clone())
                .ok_or_else(|| StoreError::NotFound(format!("reservation {id}")))
        })
    }

    fn list(
        &self,
        account_id: AccountId,
        limit: i64,
        offset: i64,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let limit = usize::try_from(limit).unwrap_or(0);
            let offset = usize::try_from(offset).unwrap_or(0);
            Ok(lock(&self.state)
                .rows
                .values()
                .filter(|row| row.reservation.account_id == account_id)
                .skip(offset)
                .take(limit)
                .map(|row| row.reservation.clone())
                .collect())
        })
    }

    fn update_status(
        &self,
        account_id: AccountId,
        id: ReservationId,
        update: StatusUpdate,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.reject_updates {
                return Err(StoreError::Database("updates rejected".to_string()));
            }
            let row = state.row_mut(account_id, id).ok_or_else(no_rows)?;

            row.reservation.status = update.status;
            if update.add_steps > 0 {
                let first_application = update
                    .step_key
                    .is_none_or(|key| row.applied_steps.insert(key));
                if first_application {
                    let reservation = &mut row.reservation;
                    reservation.step = (reservation.step + update.add_steps).min(reservation.steps);
                }
            }
            Ok(())
        })
    }

    fn finish_with_success(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let finished_at = self.now();
            let mut state = lock(&self.state);
            let Some(row) = state.row_mut(account_id, id) else {
                return Ok(false);
            };
            let reservation = &mut row.reservation;
            if reservation.is_finished() || !reservation.all_steps_done() {
                return Ok(false);
            }
            reservation.success = Some(true);
            reservation.finished_at = Some(finished_at);
            Ok(true)
        })
    }

    fn finish_with_error(
        &self,
        account_id: AccountId,
        id: ReservationId,
        message: String,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let finished_at = self.now();
            let mut state = lock(&self.state);
            let Some(row) = state.row_mut(account_id, id) else {
                return Ok(false);
            };
            let reservation = &mut row.reservation;
            if reservation.is_finished() {
                return Ok(false);
            }
            reservation.success = Some(false);
            reservation.error = message;
            reservation.finished_at = Some(finished_at);
            Ok(true)
        })
    }

    fn update_aws_pubkey_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        pubkey_name: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            match &mut state.row_mut(account_id, id).ok_or_else(no_rows)?.detail {
                ReservationDetail::Aws(aws) => {
                    aws.detail.pubkey_name = Some(pubkey_name);
                    Ok(())
                }
                _ => Err(StoreError::ProviderMismatch {
                    reservation_id: id,
                    expected: "aws",
                }),
            }
        })
    }

    fn update_aws_reservation_id(
        &self,
        account_id: AccountId,
        id: ReservationId,
        aws_reservation_id: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            match &mut state.row_mut(account_id, id).ok_or_else(no_rows)?.detail {
                ReservationDetail::Aws(aws) => {
                    aws.aws_reservation_id = Some(aws_reservation_id);
                    Ok(())
                }
                _ => Err(StoreError::ProviderMismatch {
                    reservation_id: id,
                    expected: "aws",
                }),
            }
        })
    }

    fn update_gcp_operation_name(
        &self,
        account_id: AccountId,
        id: ReservationId,
        operation_name: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            match &mut state.row_mut(account_id, id).ok_or_else(no_rows)?.detail {
                ReservationDetail::Gcp(gcp) => {
                    gcp.gcp_operation_name = Some(operation_name);
                    Ok(())
                }
                _ => Err(StoreError::ProviderMismatch {
                    reservation_id: id,
                    expected: "gcp",
                }),
            }
        })
    }

    fn update_azure_location(
        &self,
        account_id: AccountId,
        id: ReservationId,
        location: String,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            match &mut state.row_mut(account_id, id).ok_or_else(no_rows)?.detail {
                ReservationDetail::Azure(azure) => {
                    azure.detail.location = location;
                    Ok(())
                }
                _ => Err(StoreError::ProviderMismatch {
                    reservation_id: id,
                    expected: "azure",
                }),
            }
        })
    }

    fn create_instance(&self, account_id: AccountId, instance: Instance) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            let reservation_id = instance.reservation_id;
            if state.row(account_id, reservation_id).is_none() {
                return Err(StoreError::NotFound(format!(
                    "reservation {reservation_id}"
                )));
            }
            state.instances.push(instance);
            Ok(())
        })
    }

    fn list_instances(
        &self,
        account_id: AccountId,
        id: ReservationId,
    ) -> StoreFuture<'_, Vec<Instance>> {
        Box::pin(async move {
            let state = lock(&self.state);
            if state.row(account_id, id).is_none() {
                return Ok(Vec::new());
            }
            Ok(state
                .instances
                .iter()
                .filter(|instance| instance.reservation_id == id)
                .cloned()
                .collect())
        })
    }

    fn update_instance_description(
        &self,
        account_id: AccountId,
        id: ReservationId,
        instance_id: String,
        detail: InstanceDetail,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.row(account_id, id).is_none() {
                return Err(no_rows());
            }
            let instance = state
                .instances
                .iter_mut()
                .find(|instance| {
                    instance.reservation_id == id && instance.instance_id == instance_id
                })
                .ok_or_else(no_rows)?;
            instance.detail = detail;
            Ok(())
        })
    }

    fn delete(&self, account_id: AccountId, id: ReservationId) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if state.row(account_id, id).is_none() {
                return Err(no_rows());
            }
            state.rows.remove(&id);
            state.instances.retain(|instance| instance.reservation_id != id);
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct PubkeyState {
    next_key_id: i64,
    next_resource_id: i64,
    keys: HashMap<i64, Pubkey>,
    resources: Vec<PubkeyResource>,
}

/// In-memory [`PubkeyStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryPubkeyStore {
    state: Arc<Mutex<PubkeyState>>,
}

impl InMemoryPubkeyStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a key, assigning it the next id.
    pub fn add(
        &self,
        account_id: AccountId,
        name: impl Into<String>,
        body: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Pubkey {
        let mut state = lock(&self.state);
        state.next_key_id += 1;
        let pubkey = Pubkey {
            id: state.next_key_id,
            account_id,
            name: name.into(),
            body: body.into(),
            fingerprint: fingerprint.into(),
        };
        state.keys.insert(pubkey.id, pubkey.clone());
        pubkey
    }

    /// All upload records, oldest first.
    #[must_use]
    pub fn resources(&self) -> Vec<PubkeyResource> {
        lock(&self.state).resources.clone()
    }
}

impl PubkeyStore for InMemoryPubkeyStore {
    fn get(&self, account_id: AccountId, id: i64) -> StoreFuture<'_, Pubkey> {
        Box::pin(async move {
            lock(&self.state)
                .keys
                .get(&id)
                .filter(|key| key.account_id == account_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("pubkey {id}")))
        })
    }

    fn get_resource(
        &self,
        pubkey_id: i64,
        source_id: String,
        region: String,
    ) -> StoreFuture<'_, PubkeyResource> {
        Box::pin(async move {
            lock(&self.state)
                .resources
                .iter()
                .find(|r| {
                    r.pubkey_id == pubkey_id && r.source_id == source_id && r.region == region
                })
                .cloned()
                .ok_or_else(|| {
                    StoreError::NotFound(format!(
                        "pubkey resource {pubkey_id}/{source_id}/{region}"
                    ))
                })
        })
    }

    fn create_resource(&self, mut resource: PubkeyResource) -> StoreFuture<'_, PubkeyResource> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.next_resource_id += 1;
            resource.id = state.next_resource_id;
            state.resources.push(resource.clone());
            Ok(resource)
        })
    }
}

#[derive(Debug, Default)]
struct AccountState {
    next_id: i64,
    accounts: HashMap<String, Account>,
    racing_inserts: u32,
}

/// In-memory [`AccountStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryAccountStore {
    state: Arc<Mutex<AccountState>>,
}

impl InMemoryAccountStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lose the next `count` first-insert races: the account is created as if by a
    /// concurrent writer and the call reports [`StoreError::UniqueViolation`].
    pub fn lose_insert_races(&self, count: u32) {
        lock(&self.state).racing_inserts = count;
    }

    /// Number of stored accounts.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).accounts.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).accounts.is_empty()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn get_or_create(
        &self,
        org_id: String,
        account_number: Option<String>,
    ) -> StoreFuture<'_, Account> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(account) = state.accounts.get(&org_id) {
                return Ok(account.clone());
            }

            state.next_id += 1;
            let account = Account {
                id: AccountId::new(state.next_id),
                org_id: org_id.clone(),
                account_number,
            };
            state.accounts.insert(org_id, account.clone());

            if state.racing_inserts > 0 {
                state.racing_inserts -= 1;
                return Err(StoreError::UniqueViolation("accounts_org_id_key".to_string()));
            }
            Ok(account)
        })
    }
}
