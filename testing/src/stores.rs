//! In-memory persistent stores.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flash_sale_core::dead_letter::{DeadLetter, DeadLetterSink, UndecodableRecord};
use flash_sale_core::order_store::{OrderStore, OrderStoreError, ShopRepository};
use flash_sale_core::types::{Order, OrderId, PersistOutcome, Shop, ShopId, UserId, VoucherId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct OrderTables {
    stock: HashMap<VoucherId, i64>,
    orders: BTreeMap<OrderId, Order>,
    buyers: HashSet<(UserId, VoucherId)>,
    crashes_after_decrement: u32,
    failing_persists: u32,
}

/// In-memory [`OrderStore`] with transaction semantics.
///
/// `persist_order` runs under one lock and restores the stock row whenever it
/// does not commit, so a failure never leaves a partial change behind.
///
/// # Fault injection
///
/// - [`crash_after_decrement`](Self::crash_after_decrement): fail after the
///   stock decrement but before the insert (the transaction rolls back)
/// - [`fail_next_persists`](Self::fail_next_persists): fail before touching anything
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    tables: Arc<Mutex<OrderTables>>,
    persist_calls: Arc<AtomicUsize>,
}

impl InMemoryOrderStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a voucher with its durable stock
    #[must_use]
    pub fn with_voucher(self, voucher_id: VoucherId, stock: i64) -> Self {
        self.tables.lock().unwrap().stock.insert(voucher_id, stock);
        self
    }

    /// Simulate a crash between the decrement and the insert on the next `times` persists.
    pub fn crash_after_decrement(&self, times: u32) {
        self.tables.lock().unwrap().crashes_after_decrement = times;
    }

    /// Fail the next `times` persists with a database error.
    pub fn fail_next_persists(&self, times: u32) {
        self.tables.lock().unwrap().failing_persists = times;
    }

    /// Durable stock of a voucher
    #[must_use]
    pub fn stock(&self, voucher_id: VoucherId) -> Option<i64> {
        self.tables.lock().unwrap().stock.get(&voucher_id).copied()
    }

    /// All committed orders, ordered by id
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.tables.lock().unwrap().orders.values().cloned().collect()
    }

    /// Number of times `persist_order` was called
    #[must_use]
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }
}

impl OrderStore for InMemoryOrderStore {
    async fn persist_order(&self, order: &Order) -> Result<PersistOutcome, OrderStoreError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();

        if tables.failing_persists > 0 {
            tables.failing_persists -= 1;
            return Err(OrderStoreError::DatabaseError("injected failure".into()));
        }
        if tables.orders.contains_key(&order.id) {
            return Ok(PersistOutcome::Duplicate);
        }

        let Some(stock) = tables.stock.get(&order.voucher_id).copied() else {
            return Ok(PersistOutcome::OutOfStock);
        };
        if stock <= 0 {
            return Ok(PersistOutcome::OutOfStock);
        }
        tables.stock.insert(order.voucher_id, stock - 1);

        if tables.crashes_after_decrement > 0 {
            tables.crashes_after_decrement -= 1;
            tables.stock.insert(order.voucher_id, stock);
            return Err(OrderStoreError::TransactionFailed(
                "connection lost before insert".into(),
            ));
        }
        if !tables.buyers.insert((order.user_id, order.voucher_id)) {
            tables.stock.insert(order.voucher_id, stock);
            return Ok(PersistOutcome::Duplicate);
        }

        tables.orders.insert(order.id, order.clone());
        Ok(PersistOutcome::Created)
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, OrderStoreError> {
        Ok(self.tables.lock().unwrap().orders.get(&id).cloned())
    }

    async fn voucher_stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, OrderStoreError> {
        Ok(self.stock(voucher_id))
    }
}

/// In-memory [`ShopRepository`].
///
/// Counts lookups and can delay them, which is what cache-stampede tests need.
#[derive(Clone, Debug, Default)]
pub struct InMemoryShopRepository {
    shops: Arc<Mutex<BTreeMap<ShopId, Shop>>>,
    lookups: Arc<AtomicUsize>,
    latency: Duration,
}

impl InMemoryShopRepository {
    /// Create a new empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `find_shop` by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a shop row directly
    #[must_use]
    pub fn with_shop(self, shop: Shop) -> Self {
        self.shops.lock().unwrap().insert(shop.id, shop);
        self
    }

    /// Number of `find_shop` calls so far
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ShopRepository for InMemoryShopRepository {
    async fn find_shop(&self, id: ShopId) -> Result<Option<Shop>, OrderStoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.shops.lock().unwrap().get(&id).cloned())
    }

    async fn insert_shop(&self, shop: &Shop) -> Result<(), OrderStoreError> {
        let mut shops = self.shops.lock().unwrap();
        if shops.contains_key(&shop.id) {
            return Err(OrderStoreError::DatabaseError(format!(
                "duplicate key value violates unique constraint: shop {}",
                shop.id
            )));
        }
        shops.insert(shop.id, shop.clone());
        Ok(())
    }

    async fn update_shop(&self, shop: &Shop) -> Result<bool, OrderStoreError> {
        let mut shops = self.shops.lock().unwrap();
        match shops.get_mut(&shop.id) {
            Some(existing) => {
                *existing = shop.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_shop_ids(
        &self,
        after: Option<ShopId>,
        limit: usize,
    ) -> Result<Vec<ShopId>, OrderStoreError> {
        let shops = self.shops.lock().unwrap();
        Ok(shops
            .keys()
            .filter(|id| after.is_none_or(|after| **id > after))
            .take(limit)
            .copied()
            .collect())
    }
}

/// Captures dead letters for assertions.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
    undecodable: Arc<Mutex<Vec<UndecodableRecord>>>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap().clone()
    }

    /// Undecodable records set aside so far
    #[must_use]
    pub fn undecodable(&self) -> Vec<UndecodableRecord> {
        self.undecodable.lock().unwrap().clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    async fn record(&self, letter: &DeadLetter) -> Result<i64, OrderStoreError> {
        let mut letters = self.letters.lock().unwrap();
        letters.push(letter.clone());
        Ok(i64::try_from(letters.len()).unwrap_or(i64::MAX))
    }

    async fn record_undecodable(&self, record: &UndecodableRecord) -> Result<i64, OrderStoreError> {
        let mut undecodable = self.undecodable.lock().unwrap();
        undecodable.push(record.clone());
        Ok(i64::try_from(undecodable.len()).unwrap_or(i64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(id: u64, user: i64) -> Order {
        Order {
            id: OrderId(id),
            user_id: UserId(user),
            voucher_id: VoucherId(1),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn crash_rolls_back_decrement() {
        let store = InMemoryOrderStore::new().with_voucher(VoucherId(1), 1);
        store.crash_after_decrement(1);

        assert!(store.persist_order(&order(42, 7)).await.is_err());
        assert_eq!(store.stock(VoucherId(1)), Some(1));

        assert_eq!(
            store.persist_order(&order(42, 7)).await.unwrap(),
            PersistOutcome::Created
        );
        assert_eq!(store.stock(VoucherId(1)), Some(0));
    }

    #[tokio::test]
    async fn same_buyer_twice_is_duplicate() {
        let store = InMemoryOrderStore::new().with_voucher(VoucherId(1), 5);

        store.persist_order(&order(1, 7)).await.unwrap();
        assert_eq!(
            store.persist_order(&order(2, 7)).await.unwrap(),
            PersistOutcome::Duplicate
        );
        assert_eq!(store.stock(VoucherId(1)), Some(4));
    }

    #[tokio::test]
    async fn shop_ids_page_in_order() {
        let repo = InMemoryShopRepository::new();
        for id in [3, 1, 2] {
            repo.insert_shop(&Shop {
                id: ShopId(id),
                name: format!("shop {id}"),
                type_id: 1,
                address: String::new(),
                avg_price: 0,
                score: 0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        assert_eq!(repo.list_shop_ids(None, 2).await.unwrap(), vec![ShopId(1), ShopId(2)]);
        assert_eq!(repo.list_shop_ids(Some(ShopId(2)), 2).await.unwrap(), vec![ShopId(3)]);
    }
}
