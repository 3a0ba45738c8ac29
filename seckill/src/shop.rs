//! Shop reads behind the membership filter and the cache.
//!
//! ```text
//! read_shop(id) ─► filter says absent ──► NotFound (no cache, no DB)
//!                    │ maybe present
//!                    ▼
//!                cache-aside read ─► repository on miss
//! ```

use crate::bloom::{FilterError, MembershipFilter};
use crate::cache::{CacheAside, CacheError};
use flash_sale_core::kv::KeyValueStore;
use flash_sale_core::order_store::{OrderStoreError, ShopRepository};
use flash_sale_core::types::{Shop, ShopId};
use std::sync::Arc;
use thiserror::Error;

/// Default page size when warming the filter.
pub const DEFAULT_WARM_BATCH: usize = 10_000;

/// Errors from the shop service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShopError {
    /// No such shop
    #[error("Shop {0} not found")]
    NotFound(ShopId),

    /// The membership filter failed
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// The cache failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The shop table failed
    #[error("Shop repository error: {0}")]
    Repository(#[from] OrderStoreError),
}

fn cache_key(id: ShopId) -> String {
    format!("shop:{id}")
}

/// Shop read and write paths.
pub struct ShopService<K, R> {
    filter: MembershipFilter<K>,
    cache: CacheAside<K>,
    repository: Arc<R>,
    warm_batch: usize,
}

impl<K: KeyValueStore, R: ShopRepository> ShopService<K, R> {
    /// Create a shop service.
    #[must_use]
    pub const fn new(filter: MembershipFilter<K>, cache: CacheAside<K>, repository: Arc<R>) -> Self {
        Self {
            filter,
            cache,
            repository,
            warm_batch: DEFAULT_WARM_BATCH,
        }
    }

    /// Set the page size used by [`warm_filter`](Self::warm_filter).
    #[must_use]
    pub fn with_warm_batch(mut self, batch: usize) -> Self {
        self.warm_batch = batch.max(1);
        self
    }

    /// Read one shop.
    ///
    /// # Errors
    ///
    /// - [`ShopError::NotFound`] if the filter rules the id out or no row exists
    /// - [`ShopError::Cache`] if the cache is contended or unreachable
    pub async fn read_shop(&self, id: ShopId) -> Result<Shop, ShopError> {
        if !self.filter.might_contain(&id.to_string()).await? {
            tracing::debug!(shop_id = %id, "Shop rejected by membership filter");
            return Err(ShopError::NotFound(id));
        }

        let repository = Arc::clone(&self.repository);
        self.cache
            .read(&cache_key(id), || async move { repository.find_shop(id).await })
            .await?
            .ok_or(ShopError::NotFound(id))
    }

    /// Create a shop and make it visible to the filter.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::Repository`] if the insert fails (the filter is then
    /// left alone) or [`ShopError::Filter`] if the filter cannot be updated.
    pub async fn save_shop(&self, shop: &Shop) -> Result<(), ShopError> {
        self.repository.insert_shop(shop).await?;
        self.filter.add(&shop.id.to_string()).await?;
        tracing::info!(shop_id = %shop.id, "Shop saved");
        Ok(())
    }

    /// Update a shop and drop its cached copy.
    ///
    /// # Errors
    ///
    /// Returns [`ShopError::NotFound`] if no row was updated.
    pub async fn update_shop(&self, shop: &Shop) -> Result<(), ShopError> {
        if !self.repository.update_shop(shop).await? {
            return Err(ShopError::NotFound(shop.id));
        }
        self.cache.invalidate(&cache_key(shop.id)).await?;
        tracing::info!(shop_id = %shop.id, "Shop updated");
        Ok(())
    }

    /// Add every existing shop id to the filter, page by page. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns the first repository or filter error; pages added before it stay added.
    pub async fn warm_filter(&self) -> Result<usize, ShopError> {
        let mut after = None;
        let mut total = 0;

        loop {
            let page = self.repository.list_shop_ids(after, self.warm_batch).await?;
            let Some(last) = page.last().copied() else {
                break;
            };

            self.filter
                .add_batch(page.iter().map(ToString::to_string))
                .await?;
            total += page.len();
            tracing::debug!(loaded = total, "Filter warm-up progress");

            if page.len() < self.warm_batch {
                break;
            }
            after = Some(last);
        }

        tracing::info!(shops = total, "Shop filter warmed");
        Ok(total)
    }
}
