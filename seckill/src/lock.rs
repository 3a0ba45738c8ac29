//! Cross-process mutual exclusion on the shared key-value store.
//!
//! A lock is one key, `lock:{name}`, holding the owner's token with an expiry.
//! Acquisition is a single set-if-absent; release is a compare-and-delete so a
//! holder whose lock already expired can never delete a successor's lock.
//!
//! # Example
//!
//! ```rust,ignore
//! let mutex = DistributedMutex::new(store);
//! let rebuilt = mutex
//!     .with_lock("shop:7", Duration::from_secs(5), || rebuild_shop(7))
//!     .await?;
//! ```

use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::retry::{Backoff, BackoffStep, RetryPolicy};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of every lock key.
pub const LOCK_PREFIX: &str = "lock:";

/// Default number of acquisition attempts.
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 5;

/// Default sleep between acquisition attempts.
pub const DEFAULT_LOCK_BACKOFF: Duration = Duration::from_millis(50);

/// Errors from lock acquisition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Another owner held the lock on every attempt
    #[error("Lock '{key}' is contended after {attempts} attempts")]
    Contended {
        /// Full lock key
        key: String,
        /// Attempts made
        attempts: u32,
    },

    /// The store could not be reached
    #[error("Lock store error: {0}")]
    Store(#[from] StoreError),
}

/// Opaque proof of ownership returned by [`DistributedMutex::acquire`].
#[derive(Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The raw token stored as the lock value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockToken").field(&self.0).finish()
    }
}

/// Distributed mutex with owner tokens, expiry and bounded acquisition.
pub struct DistributedMutex<K> {
    store: Arc<K>,
    policy: RetryPolicy,
}

impl<K> Clone for DistributedMutex<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
        }
    }
}

impl<K: KeyValueStore> DistributedMutex<K> {
    /// Create a mutex with the default policy (5 attempts, 50ms apart).
    #[must_use]
    pub fn new(store: Arc<K>) -> Self {
        Self::with_policy(
            store,
            RetryPolicy::fixed(DEFAULT_LOCK_ATTEMPTS, DEFAULT_LOCK_BACKOFF),
        )
    }

    /// Create a mutex with a custom acquisition policy.
    #[must_use]
    pub const fn with_policy(store: Arc<K>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Full store key for a lock name.
    #[must_use]
    pub fn key(name: &str) -> String {
        format!("{LOCK_PREFIX}{name}")
    }

    /// Acquire the lock `name`, expiring after `ttl`.
    ///
    /// Never blocks indefinitely: the attempt budget of the policy bounds the wait.
    ///
    /// # Errors
    ///
    /// - [`LockError::Contended`] if every attempt found the lock held
    /// - [`LockError::Store`] if the store is unreachable
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let key = Self::key(name);
        let token = LockToken::generate();
        let mut backoff = Backoff::new(self.policy.clone());

        loop {
            if self.store.set_if_absent(&key, token.as_str(), ttl).await? {
                tracing::debug!(lock = %key, attempts = backoff.failed_attempts() + 1, "Lock acquired");
                return Ok(token);
            }

            match backoff.next_step() {
                BackoffStep::Retry { delay, .. } => tokio::time::sleep(delay).await,
                BackoffStep::Exhausted { attempts } => {
                    tracing::debug!(lock = %key, attempts, "Lock contended");
                    return Err(LockError::Contended { key, attempts });
                }
            }
        }
    }

    /// Release the lock `name` if `token` still owns it.
    ///
    /// Returns `false` if the lock had expired or passed to another owner, in
    /// which case nothing was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store is unreachable.
    pub async fn release(&self, name: &str, token: &LockToken) -> Result<bool, LockError> {
        let key = Self::key(name);
        let released = self.store.delete_if_equals(&key, token.as_str()).await?;
        if !released {
            tracing::debug!(lock = %key, "Lock no longer owned, release skipped");
        }
        Ok(released)
    }

    /// Run `critical` while holding the lock `name`.
    ///
    /// The lock is released after `critical` completes, whatever it returns. A
    /// failed release is logged; the lock then lapses at its expiry.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] if the lock cannot be acquired; `critical` is not run.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl: Duration,
        critical: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = self.acquire(name, ttl).await?;
        let result = critical().await;

        if let Err(e) = self.release(name, &token).await {
            tracing::warn!(lock = name, error = %e, "Failed to release lock, it will expire");
        }

        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flash_sale_testing::InMemoryKeyValueStore;

    const TTL: Duration = Duration::from_secs(5);

    fn mutex() -> (Arc<InMemoryKeyValueStore>, DistributedMutex<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        (Arc::clone(&store), DistributedMutex::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_is_contended_until_release() {
        let (_, mutex) = mutex();
        let token = mutex.acquire("order:7", TTL).await.unwrap();

        let err = mutex.acquire("order:7", TTL).await.unwrap_err();
        assert_eq!(
            err,
            LockError::Contended {
                key: "lock:order:7".to_string(),
                attempts: 5
            }
        );

        assert!(mutex.release("order:7", &token).await.unwrap());
        assert!(mutex.acquire("order:7", TTL).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_never_both_succeed() {
        let (_, mutex) = mutex();
        let (a, b) = tokio::join!(mutex.acquire("k", TTL), mutex.acquire("k", TTL));

        assert!(a.is_ok() ^ b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_token_cannot_release_successor() {
        let (store, mutex) = mutex();
        let stale = mutex.acquire("k", Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let fresh = mutex.acquire("k", TTL).await.unwrap();

        assert!(!mutex.release("k", &stale).await.unwrap());
        assert_eq!(
            store.get("lock:k").await.unwrap().as_deref(),
            Some(fresh.as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_lock_released_between_attempts() {
        let (_, mutex) = mutex();
        let token = mutex.acquire("k", TTL).await.unwrap();

        let holder = mutex.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            holder.release("k", &token).await.unwrap();
        });

        assert!(mutex.acquire("k", TTL).await.is_ok());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn with_lock_releases_after_critical_section() {
        let (store, mutex) = mutex();

        let value = mutex.with_lock("k", TTL, || async { 42 }).await.unwrap();

        assert_eq!(value, 42);
        assert!(!store.exists("lock:k").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_store_is_not_contention() {
        let (store, mutex) = mutex();
        store.set_unavailable(true);

        assert!(matches!(
            mutex.acquire("k", TTL).await,
            Err(LockError::Store(StoreError::Unavailable(_)))
        ));
    }
}
