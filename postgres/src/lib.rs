//! `PostgreSQL` backend for the provisioning job engine.
//!
//! This crate provides:
//!
//! - [`PostgresJobQueue`]: durable queue with leases and redelivery after lease expiry
//! - [`PostgresReservationStore`], [`PostgresPubkeyStore`], [`PostgresAccountStore`]:
//!   the store traits from `provisioning-core`
//! - [`connect`] and [`migrate`]: pool setup and embedded schema migrations
//!
//! # Example
//!
//! ```no_run
//! use provisioning_postgres::{PostgresJobQueue, PostgresQueueConfig, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/provisioning", 10).await?;
//! migrate(&pool).await?;
//! let queue = PostgresJobQueue::new(pool, PostgresQueueConfig::default());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accounts;
pub mod pubkeys;
pub mod queue;
pub mod reservations;

pub use accounts::PostgresAccountStore;
pub use pubkeys::PostgresPubkeyStore;
pub use queue::{FailedJob, PostgresJobQueue, PostgresQueueConfig};
pub use reservations::PostgresReservationStore;

use provisioning_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if the first connection cannot be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Apply the embedded schema migrations.
///
/// # Errors
///
/// Returns the migration error if any migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Map a driver error to a store error, keeping unique violations distinguishable.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::UniqueViolation(db.constraint().unwrap_or_default().to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(error.to_string()),
        _ => StoreError::Database(error.to_string()),
    }
}
