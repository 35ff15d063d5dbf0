//! Account store.

use crate::store_error;
use provisioning_core::pubkey::Account;
use provisioning_core::reservation::AccountId;
use provisioning_core::store::{AccountStore, StoreError, StoreFuture};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL` [`AccountStore`].
#[derive(Debug, Clone)]
pub struct PostgresAccountStore {
    pool: PgPool,
}

impl PostgresAccountStore {
    /// Store on `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_account(row: &PgRow) -> Result<Account, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    Ok(Account {
        id: AccountId::new(row.try_get("id").map_err(decode)?),
        org_id: row.try_get("org_id").map_err(decode)?,
        account_number: row.try_get("account_number").map_err(decode)?,
    })
}

impl AccountStore for PostgresAccountStore {
    fn get_or_create(
        &self,
        org_id: String,
        account_number: Option<String>,
    ) -> StoreFuture<'_, Account> {
        Box::pin(async move {
            let existing =
                sqlx::query("SELECT id, org_id, account_number FROM accounts WHERE org_id = $1")
                    .bind(&org_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(store_error)?;
            if let Some(row) = existing {
                return row_to_account(&row);
            }

            // A concurrent first call wins the insert; ours reports a unique violation.
            let row = sqlx::query(
                r"
                INSERT INTO accounts (org_id, account_number) VALUES ($1, $2)
                RETURNING id, org_id, account_number
                ",
            )
            .bind(&org_id)
            .bind(&account_number)
            .fetch_one(&self.pool)
            .await
            .map_err(store_error)?;

            let account = row_to_account(&row)?;
            tracing::info!(account_id = %account.id, org_id = %account.org_id, "Account created");
            Ok(account)
        })
    }
}
