//! Dead Letter Queue (DLQ) for failed order messages.
//!
//! Order messages land here after exhausting redelivery. Each entry keeps the
//! user, voucher and order ids so an operator can re-publish or refund by hand.
//! Records that never decoded into an order message are kept byte for byte in
//! a separate table, keyed by partition and offset.

use crate::{order_id_column, order_id_from_column};
use chrono::{DateTime, Utc};
use flash_sale_core::dead_letter::{
    DeadLetter, DeadLetterSink, DeadLetterStatus, UndecodableRecord,
};
use flash_sale_core::order_store::OrderStoreError;
use flash_sale_core::types::{OrderMessage, UserId, VoucherId};
use sqlx::{PgPool, Row};

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedOrder {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The message that failed (its `attempt` is the number of failed deliveries)
    pub message: OrderMessage,

    /// Error message from the last failure
    pub error_message: String,

    /// Number of deliveries that failed
    pub attempts: i32,

    /// When the message was dead-lettered
    pub first_failed_at: DateTime<Utc>,

    /// When the entry last changed status
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DeadLetterStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue for failed order messages.
///
/// # Example
///
/// ```no_run
/// use flash_sale_postgres::DeadLetterQueue;
/// use flash_sale_core::dead_letter::DeadLetterStatus;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(first) = pending.first() {
///     dlq.update_status(first.id, DeadLetterStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed order message to the DLQ.
    ///
    /// Returns the unique ID of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, OrderStoreError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);

        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_orders (
                order_id, user_id, voucher_id, attempts, error_message,
                first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $6)
            RETURNING id
            ",
        )
        .bind(order_id_column(letter.message.order_id)?)
        .bind(letter.message.user_id.get())
        .bind(letter.message.voucher_id.get())
        .bind(attempts)
        .bind(&letter.error)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(
            dlq_id = id.0,
            order_id = %letter.message.order_id,
            user_id = %letter.message.user_id,
            voucher_id = %letter.message.voucher_id,
            error = %letter.error,
            attempts = letter.attempts,
            "Order message added to Dead Letter Queue"
        );

        Ok(id.0)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedOrder>, OrderStoreError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<FailedOrder>, OrderStoreError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT
                id, order_id, user_id, voucher_id, attempts, error_message,
                first_failed_at, last_failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_orders
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_order).collect()
    }

    /// Get a specific entry by ID.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the query fails or the entry is not found.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedOrder, OrderStoreError> {
        let row = sqlx::query(
            r"
            SELECT
                id, order_id, user_id, voucher_id, attempts, error_message,
                first_failed_at, last_failed_at, status,
                resolved_at, resolved_by, resolution_notes
            FROM failed_orders
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        Self::row_to_failed_order(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the update fails.
    pub async fn update_status(
        &self,
        id: i64,
        status: DeadLetterStatus,
    ) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            UPDATE failed_orders
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as resolved, e.g. after the order was re-published.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            UPDATE failed_orders
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");

        metrics::counter!("flash_sale.dlq.resolved").increment(1);

        Ok(())
    }

    /// Mark an entry as discarded, e.g. after the buyer was refunded.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), OrderStoreError> {
        sqlx::query(
            r"
            UPDATE failed_orders
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");

        metrics::counter!("flash_sale.dlq.discarded").increment(1);

        Ok(())
    }

    /// Count of pending entries, for monitoring.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, OrderStoreError> {
        let (count,): (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*)
            FROM failed_orders
            WHERE status = 'pending'
            ",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        Ok(count)
    }

    /// Keep an undecodable record. A record seen twice keeps its first entry.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the insert fails.
    pub async fn add_undecodable(&self, record: &UndecodableRecord) -> Result<i64, OrderStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO undecodable_order_records (
                topic_partition, topic_offset, payload, error_message, received_at
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (topic_partition, topic_offset)
                DO UPDATE SET error_message = undecodable_order_records.error_message
            RETURNING id
            ",
        )
        .bind(record.partition)
        .bind(record.offset)
        .bind(&record.payload)
        .bind(&record.error)
        .bind(record.received_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        tracing::warn!(
            entry_id = id,
            partition = record.partition,
            offset = record.offset,
            payload_len = record.payload.len(),
            error = %record.error,
            "Undecodable order record kept for inspection"
        );

        Ok(id)
    }

    /// List undecodable records, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the query fails.
    pub async fn list_undecodable(
        &self,
        limit: usize,
    ) -> Result<Vec<UndecodableRecord>, OrderStoreError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT topic_partition, topic_offset, payload, error_message, received_at
            FROM undecodable_order_records
            ORDER BY received_at ASC, id ASC
            LIMIT $1
            ",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|row| UndecodableRecord {
                partition: row.get("topic_partition"),
                offset: row.get("topic_offset"),
                payload: row.get("payload"),
                error: row.get("error_message"),
                received_at: row.get("received_at"),
            })
            .collect())
    }

    fn row_to_failed_order(row: &sqlx::postgres::PgRow) -> Result<FailedOrder, OrderStoreError> {
        let status_str: String = row.get("status");
        let status = DeadLetterStatus::parse(&status_str)?;
        let attempts: i32 = row.get("attempts");

        Ok(FailedOrder {
            id: row.get("id"),
            message: OrderMessage {
                user_id: UserId(row.get("user_id")),
                voucher_id: VoucherId(row.get("voucher_id")),
                order_id: order_id_from_column(row.get("order_id"))?,
                attempt: u32::try_from(attempts).unwrap_or(0),
            },
            error_message: row.get("error_message"),
            attempts,
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    async fn record(&self, letter: &DeadLetter) -> Result<i64, OrderStoreError> {
        self.add_entry(letter).await
    }

    async fn record_undecodable(&self, record: &UndecodableRecord) -> Result<i64, OrderStoreError> {
        self.add_undecodable(record).await
    }
}
