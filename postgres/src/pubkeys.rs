//! Public key store.

use crate::store_error;
use provisioning_core::pubkey::{Pubkey, PubkeyResource};
use provisioning_core::reservation::AccountId;
use provisioning_core::store::{PubkeyStore, StoreError, StoreFuture};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL` [`PubkeyStore`].
#[derive(Debug, Clone)]
pub struct PostgresPubkeyStore {
    pool: PgPool,
}

impl PostgresPubkeyStore {
    /// Store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a key for a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UniqueViolation`] if the tenant already has a key with that name.
    pub async fn create(
        &self,
        account_id: AccountId,
        name: &str,
        body: &str,
        fingerprint: &str,
    ) -> Result<Pubkey, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"
            INSERT INTO pubkeys (account_id, name, body, fingerprint)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            ",
        )
        .bind(account_id.get())
        .bind(name)
        .bind(body)
        .bind(fingerprint)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(Pubkey {
            id,
            account_id,
            name: name.to_string(),
            body: body.to_string(),
            fingerprint: fingerprint.to_string(),
        })
    }
}

fn row_to_resource(row: &PgRow) -> Result<PubkeyResource, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    let provider: String = row.try_get("provider").map_err(decode)?;
    Ok(PubkeyResource {
        id: row.try_get("id").map_err(decode)?,
        pubkey_id: row.try_get("pubkey_id").map_err(decode)?,
        provider: provider
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?,
        source_id: row.try_get("source_id").map_err(decode)?,
        region: row.try_get("region").map_err(decode)?,
        tag: row.try_get("tag").map_err(decode)?,
        handle: row.try_get("handle").map_err(decode)?,
    })
}

impl PubkeyStore for PostgresPubkeyStore {
    fn get(&self, account_id: AccountId, id: i64) -> StoreFuture<'_, Pubkey> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, name, body, fingerprint FROM pubkeys WHERE id = $1 AND account_id = $2",
            )
            .bind(id)
            .bind(account_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or_else(|| StoreError::NotFound(format!("pubkey {id}")))?;

            let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
            Ok(Pubkey {
                id: row.try_get("id").map_err(decode)?,
                account_id,
                name: row.try_get("name").map_err(decode)?,
                body: row.try_get("body").map_err(decode)?,
                fingerprint: row.try_get("fingerprint").map_err(decode)?,
            })
        })
    }

    fn get_resource(
        &self,
        pubkey_id: i64,
        source_id: String,
        region: String,
    ) -> StoreFuture<'_, PubkeyResource> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, pubkey_id, provider, source_id, region, tag, handle
                FROM pubkey_resources
                WHERE pubkey_id = $1 AND source_id = $2 AND region = $3
                ",
            )
            .bind(pubkey_id)
            .bind(&source_id)
            .bind(&region)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                StoreError::NotFound(format!("pubkey resource {pubkey_id}/{source_id}/{region}"))
            })?;

            row_to_resource(&row)
        })
    }

    fn create_resource(&self, resource: PubkeyResource) -> StoreFuture<'_, PubkeyResource> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO pubkey_resources (pubkey_id, provider, source_id, region, tag, handle)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING id, pubkey_id, provider, source_id, region, tag, handle
                ",
            )
            .bind(resource.pubkey_id)
            .bind(resource.provider.as_str())
            .bind(&resource.source_id)
            .bind(&resource.region)
            .bind(&resource.tag)
            .bind(&resource.handle)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

            row_to_resource(&row)
        })
    }
}
