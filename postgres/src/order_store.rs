//! Transactional order persistence.

use crate::{order_id_column, order_id_from_column};
use chrono::{DateTime, Utc};
use flash_sale_core::order_store::{OrderStore, OrderStoreError};
use flash_sale_core::types::{Order, OrderId, PersistOutcome, UserId, Voucher, VoucherId};
use sqlx::{PgPool, Postgres, Row, Transaction};

/// `PostgreSQL` order store.
///
/// `persist_order` is the durable half of the pipeline. It runs in one
/// transaction so a crash between the stock decrement and the insert rolls both
/// back, and it is safe to call any number of times with the same order.
#[derive(Clone)]
pub struct PostgresOrderStore {
    /// `PostgreSQL` connection pool.
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a new order store.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or replace a voucher row with its durable stock and window.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the upsert fails.
    pub async fn register_voucher(&self, voucher: &Voucher) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            INSERT INTO seckill_vouchers (voucher_id, stock, begin_time, end_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (voucher_id) DO UPDATE
            SET stock = EXCLUDED.stock,
                begin_time = EXCLUDED.begin_time,
                end_time = EXCLUDED.end_time,
                updated_at = NOW()
            ",
        )
        .bind(voucher.id.get())
        .bind(i64::from(voucher.stock))
        .bind(voucher.window.begins_at)
        .bind(voucher.window.ends_at)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to register voucher: {e}")))?;

        tracing::info!(voucher_id = %voucher.id, stock = voucher.stock, "Voucher registered");
        Ok(())
    }

    async fn rollback(tx: Transaction<'_, Postgres>) {
        if let Err(e) = tx.rollback().await {
            tracing::warn!(error = %e, "Failed to roll back order transaction");
        }
    }
}

impl OrderStore for PostgresOrderStore {
    async fn persist_order(&self, order: &Order) -> Result<PersistOutcome, OrderStoreError> {
        let id = order_id_column(order.id)?;

        let mut tx = self.pool.begin().await.map_err(|e| {
            OrderStoreError::TransactionFailed(format!("Failed to start transaction: {e}"))
        })?;

        // Step 1: a redelivered message whose order already exists is a no-op.
        let existing = sqlx::query("SELECT 1 FROM voucher_orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to look up order: {e}")))?;
        if existing.is_some() {
            Self::rollback(tx).await;
            tracing::debug!(order_id = %order.id, "Order already persisted");
            return Ok(PersistOutcome::Duplicate);
        }

        // Step 2: durable decrement, guarded so stock never goes negative.
        let decremented = sqlx::query(
            r"
            UPDATE seckill_vouchers
            SET stock = stock - 1, updated_at = NOW()
            WHERE voucher_id = $1 AND stock > 0
            ",
        )
        .bind(order.voucher_id.get())
        .execute(&mut *tx)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to decrement stock: {e}")))?
        .rows_affected();
        if decremented == 0 {
            Self::rollback(tx).await;
            return Ok(PersistOutcome::OutOfStock);
        }

        // Step 3: insert; a conflict on id or (user, voucher) undoes step 2.
        let inserted = sqlx::query(
            r"
            INSERT INTO voucher_orders (id, user_id, voucher_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(id)
        .bind(order.user_id.get())
        .bind(order.voucher_id.get())
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to insert order: {e}")))?
        .rows_affected();
        if inserted == 0 {
            Self::rollback(tx).await;
            tracing::debug!(
                order_id = %order.id,
                user_id = %order.user_id,
                voucher_id = %order.voucher_id,
                "Order conflicts with an existing one"
            );
            return Ok(PersistOutcome::Duplicate);
        }

        tx.commit().await.map_err(|e| {
            OrderStoreError::TransactionFailed(format!("Failed to commit transaction: {e}"))
        })?;

        Ok(PersistOutcome::Created)
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, voucher_id, created_at
            FROM voucher_orders
            WHERE id = $1
            ",
        )
        .bind(order_id_column(id)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to get order: {e}")))?;

        row.map(|row| {
            let created_at: DateTime<Utc> = row.get("created_at");
            Ok(Order {
                id: order_id_from_column(row.get("id"))?,
                user_id: UserId(row.get("user_id")),
                voucher_id: VoucherId(row.get("voucher_id")),
                created_at,
            })
        })
        .transpose()
    }

    async fn voucher_stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, OrderStoreError> {
        let stock: Option<(i64,)> =
            sqlx::query_as("SELECT stock FROM seckill_vouchers WHERE voucher_id = $1")
                .bind(voucher_id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    OrderStoreError::DatabaseError(format!("Failed to get voucher stock: {e}"))
                })?;

        Ok(stock.map(|(stock,)| stock))
    }
}
