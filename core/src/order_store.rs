//! Persistent store collaborators.
//!
//! The relational database is not part of the pipeline; these traits name the
//! few operations the pipeline calls on it.

use crate::types::{Order, OrderId, PersistOutcome, Shop, ShopId, VoucherId};
use std::future::Future;
use thiserror::Error;

/// Errors that can occur in the persistent store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderStoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A transaction could not be committed
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// A value could not be represented in the database schema
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Durable order persistence.
pub trait OrderStore: Send + Sync {
    /// Idempotently materialize an order, as one local transaction.
    ///
    /// 1. an order with `order.id` exists → [`PersistOutcome::Duplicate`]
    /// 2. decrement the voucher's stock where stock `> 0`; no row → [`PersistOutcome::OutOfStock`]
    /// 3. insert the order; a uniqueness conflict rolls back step 2 → [`PersistOutcome::Duplicate`]
    ///
    /// Any error leaves the store unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the transaction cannot be completed.
    fn persist_order(
        &self,
        order: &Order,
    ) -> impl Future<Output = Result<PersistOutcome, OrderStoreError>> + Send;

    /// Look up an order by id.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the query fails.
    fn find_order(
        &self,
        id: OrderId,
    ) -> impl Future<Output = Result<Option<Order>, OrderStoreError>> + Send;

    /// Current durable stock of a voucher, if the voucher exists.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the query fails.
    fn voucher_stock(
        &self,
        voucher_id: VoucherId,
    ) -> impl Future<Output = Result<Option<i64>, OrderStoreError>> + Send;
}

/// Shop rows behind the cache-guarded read path.
pub trait ShopRepository: Send + Sync {
    /// Load one shop.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the query fails.
    fn find_shop(
        &self,
        id: ShopId,
    ) -> impl Future<Output = Result<Option<Shop>, OrderStoreError>> + Send;

    /// Insert a new shop.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the insert fails.
    fn insert_shop(&self, shop: &Shop) -> impl Future<Output = Result<(), OrderStoreError>> + Send;

    /// Update an existing shop. Returns `false` if no such shop exists.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the update fails.
    fn update_shop(&self, shop: &Shop)
    -> impl Future<Output = Result<bool, OrderStoreError>> + Send;

    /// Shop ids greater than `after`, ascending, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError`] if the query fails.
    fn list_shop_ids(
        &self,
        after: Option<ShopId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ShopId>, OrderStoreError>> + Send;
}
