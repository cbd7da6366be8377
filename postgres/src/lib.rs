//! `PostgreSQL` adapters for the Rentflow services.
//!
//! Each service owns its own database; this crate ships one migration set per
//! service and the stores that run against it:
//!
//! | Service | Migrations | Stores |
//! |---|---|---|
//! | Reservation | `migrations/reservation` | [`PostgresReservationStore`], [`PostgresVehicleCatalog`] |
//! | Payment | `migrations/payment` | [`PostgresPaymentStore`] |
//! | Analytics | `migrations/analytics` | [`PostgresAnalyticsStore`] |
//!
//! Every database also carries `consumer_offsets` (saga consumer positions, written in
//! the same transaction as the change they guard) and `failed_messages`
//! ([`DeadLetterQueue`]).
//!
//! # Example
//!
//! ```ignore
//! use rentflow_postgres::{ServiceDatabase, connect, migrate, PostgresReservationStore};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = connect("postgres://localhost/reservations", 10).await?;
//!     migrate(&pool, ServiceDatabase::Reservation).await?;
//!     let store = PostgresReservationStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod analytics;
mod dead_letter_queue;
mod offsets;
mod payments;
mod reservations;

pub use analytics::PostgresAnalyticsStore;
pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedMessage};
pub use payments::PostgresPaymentStore;
pub use reservations::{PostgresReservationStore, PostgresVehicleCatalog};

use rentflow_core::error::StoreError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Which service schema to migrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDatabase {
    /// Reservations, vehicles, reservation outbox
    Reservation,
    /// Payments, capture events
    Payment,
    /// Analytics replica and revenue ledger
    Analytics,
}

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(db_error)
}

/// Run the migrations of `database`.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if a migration fails.
pub async fn migrate(pool: &PgPool, database: ServiceDatabase) -> Result<(), StoreError> {
    let result = match database {
        ServiceDatabase::Reservation => sqlx::migrate!("./migrations/reservation").run(pool).await,
        ServiceDatabase::Payment => sqlx::migrate!("./migrations/payment").run(pool).await,
        ServiceDatabase::Analytics => sqlx::migrate!("./migrations/analytics").run(pool).await,
    };
    result.map_err(|e| StoreError::Unavailable(format!("migration failed: {e}")))?;
    tracing::info!(?database, "Migrations applied");
    Ok(())
}

/// Map a driver error onto the port taxonomy.
///
/// Unique violations become conflicts; everything else (connection loss, lock or
/// serialization failures, pool timeouts) is worth retrying.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Unavailable(error.to_string())
}

/// `usize` limit to a SQL `BIGINT`.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Stored cents to [`rentflow_core::Money`].
pub(crate) fn money(cents: i64) -> Result<rentflow_core::Money, StoreError> {
    u64::try_from(cents)
        .map(rentflow_core::Money::from_cents)
        .map_err(|_| StoreError::Corrupt(format!("negative amount {cents}")))
}

/// [`rentflow_core::Money`] to stored cents.
pub(crate) fn cents(amount: rentflow_core::Money) -> Result<i64, StoreError> {
    i64::try_from(amount.cents())
        .map_err(|_| StoreError::Conflict(format!("amount {amount} out of range")))
}
