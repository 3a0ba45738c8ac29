//! `PostgreSQL` persistence for the flash sale pipeline.
//!
//! This crate implements the durable side of the pipeline over `sqlx`:
//!
//! - [`PostgresOrderStore`]: the idempotent, transactional persist procedure
//! - [`PostgresShopRepository`]: shop rows behind the cached read path
//! - [`DeadLetterQueue`]: order messages that exhausted redelivery
//!
//! All three share one pool and one schema; [`migrate`] creates it.
//!
//! # Example
//!
//! ```no_run
//! use flash_sale_postgres::{PostgresOrderStore, connect, migrate};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/flash_sale", 10).await?;
//! migrate(&pool).await?;
//! let orders = PostgresOrderStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod order_store;
mod shop;

pub use dead_letter_queue::{DeadLetterQueue, FailedOrder};
pub use order_store::PostgresOrderStore;
pub use shop::PostgresShopRepository;

use flash_sale_core::order_store::OrderStoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`OrderStoreError::DatabaseError`] if the database is unreachable.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, OrderStoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to connect: {e}")))
}

/// Run database migrations (vouchers, orders, shops, failed and undecodable orders).
///
/// # Errors
///
/// Returns [`OrderStoreError::DatabaseError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), OrderStoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// Convert a minted order id to the signed `BIGINT` column type.
pub(crate) fn order_id_column(id: flash_sale_core::OrderId) -> Result<i64, OrderStoreError> {
    i64::try_from(id.get())
        .map_err(|_| OrderStoreError::InvalidValue(format!("order id {id} exceeds BIGINT")))
}

/// Convert a `BIGINT` column back to an order id.
pub(crate) fn order_id_from_column(raw: i64) -> Result<flash_sale_core::OrderId, OrderStoreError> {
    u64::try_from(raw)
        .map(flash_sale_core::OrderId)
        .map_err(|_| OrderStoreError::InvalidValue(format!("negative order id {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flash_sale_core::OrderId;

    #[test]
    fn order_id_column_rejects_overflow() {
        assert_eq!(order_id_column(OrderId(42)), Ok(42));
        assert!(order_id_column(OrderId(u64::MAX)).is_err());
        assert!(order_id_from_column(-1).is_err());
    }
}
