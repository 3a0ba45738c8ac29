//! Cache-aside reads with mutex-guarded rebuilds.
//!
//! For a logical key `k` the cached value lives at `cache:{k}` and rebuilds are
//! serialized by the lock `lock:{k}`. Only the lock winner calls the loader;
//! everyone else waits for the lock and then finds the rebuilt value.
//!
//! ```text
//! read(k) ─► GET cache:k ──hit──► value
//!                 │ miss
//!                 ▼
//!         acquire lock:k ──contended──► CacheError::Contended
//!                 │
//!                 ▼
//!         GET cache:k again ──hit──► value
//!                 │ miss
//!                 ▼
//!         loader() ─► SET cache:k EX ttl ─► release lock:k ─► value
//! ```

use crate::lock::{DistributedMutex, LockError};
use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::retry::RetryPolicy;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default lifetime of a cached value.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Default expiry of the rebuild lock.
pub const DEFAULT_REBUILD_LOCK_TTL: Duration = Duration::from_secs(5);

/// Errors from cache-aside reads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Another caller held the rebuild lock on every attempt
    #[error("Cache rebuild of '{key}' is contended")]
    Contended {
        /// Logical key
        key: String,
    },

    /// The cache could not be reached
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    /// The loader failed
    #[error("Loader failed: {0}")]
    Loader(String),

    /// A value could not be encoded for the cache
    #[error("Cache serialization failed: {0}")]
    Serialization(String),
}

/// Cache-aside guard over the shared store.
pub struct CacheAside<K> {
    store: Arc<K>,
    mutex: DistributedMutex<K>,
    ttl: Duration,
    lock_ttl: Duration,
}

impl<K> Clone for CacheAside<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            mutex: self.mutex.clone(),
            ttl: self.ttl,
            lock_ttl: self.lock_ttl,
        }
    }
}

impl<K: KeyValueStore> CacheAside<K> {
    /// Create a guard with the default TTL and lock policy.
    #[must_use]
    pub fn new(store: Arc<K>) -> Self {
        let mutex = DistributedMutex::new(Arc::clone(&store));
        Self {
            store,
            mutex,
            ttl: DEFAULT_CACHE_TTL,
            lock_ttl: DEFAULT_REBUILD_LOCK_TTL,
        }
    }

    /// Set the lifetime of cached values.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the rebuild lock policy and expiry.
    #[must_use]
    pub fn with_lock_policy(mut self, policy: RetryPolicy, lock_ttl: Duration) -> Self {
        self.mutex = DistributedMutex::with_policy(Arc::clone(&self.store), policy);
        self.lock_ttl = lock_ttl;
        self
    }

    fn cache_key(key: &str) -> String {
        format!("cache:{key}")
    }

    async fn cached<T: DeserializeOwned>(&self, cache_key: &str) -> Result<Option<T>, CacheError> {
        let Some(raw) = self.store.get(cache_key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key = cache_key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Read `key`, calling `loader` at most once across all concurrent callers on a miss.
    ///
    /// A loader result of `None` is returned as is and not cached.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Contended`] if the rebuild lock stayed taken
    /// - [`CacheError::Loader`] if the loader failed (the lock is still released)
    /// - [`CacheError::Store`] if the cache is unreachable
    pub async fn read<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let cache_key = Self::cache_key(key);
        if let Some(hit) = self.cached(&cache_key).await? {
            tracing::debug!(key, "Cache hit");
            return Ok(Some(hit));
        }

        let cache_key = &cache_key;
        self.mutex
            .with_lock(key, self.lock_ttl, move || async move {
                // Someone else may have rebuilt while we waited for the lock.
                if let Some(hit) = self.cached(cache_key).await? {
                    return Ok(Some(hit));
                }

                tracing::debug!(key, "Cache miss, loading");
                let loaded = loader().await.map_err(|e| CacheError::Loader(e.to_string()))?;
                if let Some(value) = &loaded {
                    let encoded = serde_json::to_string(value)
                        .map_err(|e| CacheError::Serialization(e.to_string()))?;
                    self.store.set_with_ttl(cache_key, &encoded, self.ttl).await?;
                }
                Ok::<_, CacheError>(loaded)
            })
            .await
            .map_err(|e| match e {
                LockError::Contended { .. } => CacheError::Contended {
                    key: key.to_string(),
                },
                LockError::Store(e) => CacheError::Store(e),
            })?
    }

    /// Drop the cached value of `key`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Store`] if the cache is unreachable.
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let removed = self.store.delete(&Self::cache_key(key)).await?;
        tracing::debug!(key, removed, "Cache entry invalidated");
        Ok(removed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flash_sale_testing::InMemoryKeyValueStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> (Arc<InMemoryKeyValueStore>, CacheAside<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        (Arc::clone(&store), CacheAside::new(store))
    }

    #[tokio::test]
    async fn miss_loads_and_caches_with_ttl() {
        let (store, cache) = cache();

        let value = cache
            .read("shop:1", || async { Ok::<_, String>(Some(7_i64)) })
            .await
            .unwrap();
        let again = cache
            .read("shop:1", || async { Err::<Option<i64>, _>("must not be called") })
            .await
            .unwrap();

        assert_eq!(value, Some(7));
        assert_eq!(again, Some(7));
        assert_eq!(store.get("cache:shop:1").await.unwrap().as_deref(), Some("7"));
        assert!(!store.exists("lock:shop:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cached_values_expire() {
        let (_, cache) = cache();
        let cache = cache.with_ttl(Duration::from_secs(60));
        cache
            .read("shop:1", || async { Ok::<_, String>(Some(1_i64)) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let reloaded = cache
            .read("shop:1", || async { Ok::<_, String>(Some(2_i64)) })
            .await
            .unwrap();

        assert_eq!(reloaded, Some(2));
    }

    #[tokio::test]
    async fn absent_values_are_not_cached() {
        let (store, cache) = cache();

        let value = cache
            .read("shop:9", || async { Ok::<Option<i64>, String>(None) })
            .await
            .unwrap();

        assert_eq!(value, None);
        assert!(!store.exists("cache:shop:9").await.unwrap());
    }

    #[tokio::test]
    async fn loader_error_releases_lock() {
        let (store, cache) = cache();

        let err = cache
            .read("shop:1", || async { Err::<Option<i64>, _>("db down") })
            .await
            .unwrap_err();

        assert_eq!(err, CacheError::Loader("db down".to_string()));
        assert!(!store.exists("lock:shop:1").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_load_once() {
        let (_, cache) = cache();
        let loads = Arc::new(AtomicUsize::new(0));

        let reads = (0..8).map(|_| {
            let cache = cache.clone();
            let loads = Arc::clone(&loads);
            tokio::spawn(async move {
                cache
                    .read("shop:1", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, String>(Some(42_i64))
                    })
                    .await
            })
        });
        let results = futures::future::join_all(reads).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap(), Some(42));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_rebuild_reports_contention() {
        let (store, cache) = cache();
        store
            .set_if_absent("lock:shop:1", "someone-else", Duration::from_secs(5))
            .await
            .unwrap();

        let err = cache
            .read("shop:1", || async { Ok::<_, String>(Some(1_i64)) })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CacheError::Contended {
                key: "shop:1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let (_, cache) = cache();
        cache
            .read("shop:1", || async { Ok::<_, String>(Some(1_i64)) })
            .await
            .unwrap();

        assert!(cache.invalidate("shop:1").await.unwrap());
        let reloaded = cache
            .read("shop:1", || async { Ok::<_, String>(Some(2_i64)) })
            .await
            .unwrap();

        assert_eq!(reloaded, Some(2));
    }
}
