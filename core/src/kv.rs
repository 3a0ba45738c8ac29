//! Shared key-value store abstraction.
//!
//! Every cross-process guarantee of the flash sale (mutual exclusion, admission,
//! id allocation, the membership filter bitmap, the read cache) rests on the
//! atomic primitives of one shared key-value store. This module names exactly
//! the primitives the pipeline needs so that the production store (`Redis`) and
//! the in-memory test double implement the same contract.
//!
//! # Atomicity
//!
//! Each method is a single atomic operation on the store. In particular
//! [`KeyValueStore::run_admission`] and [`KeyValueStore::revoke_admission`] must
//! execute as one indivisible unit (a server-side script), never as a sequence
//! of round-trips.

use crate::types::AdmissionOutcome;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the shared key-value store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A command was rejected by the store
    #[error("Store command failed: {0}")]
    CommandFailed(String),

    /// A script returned a value outside its contract
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(String),
}

/// Atomic primitives of the shared key-value store.
///
/// # Example
///
/// ```rust,ignore
/// use flash_sale_core::kv::KeyValueStore;
/// use std::time::Duration;
///
/// async fn lock_once(store: &impl KeyValueStore) -> Result<bool, StoreError> {
///     store.set_if_absent("lock:demo", "token-1", Duration::from_secs(5)).await
/// }
/// ```
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value` with an expiry, only if `key` does not exist.
    ///
    /// Returns `true` if the value was written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Delete `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Atomically increment the integer at `key` (missing keys start at 0).
    ///
    /// Returns the value after the increment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the value is not an integer.
    fn increment(&self, key: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Run the admission decision as one atomic script.
    ///
    /// 1. stock at `stock_key` missing or `<= 0` → [`AdmissionOutcome::StockExhausted`]
    /// 2. `member` already in the set at `buyers_key` → [`AdmissionOutcome::DuplicateUser`]
    /// 3. otherwise decrement stock, add `member`, → [`AdmissionOutcome::Admitted`]
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the script misbehaves.
    fn run_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> impl Future<Output = Result<AdmissionOutcome, StoreError>> + Send;

    /// Undo one admission as one atomic script.
    ///
    /// If `member` is in the set at `buyers_key` it is removed and the stock at
    /// `stock_key` is incremented. Returns `true` if anything was undone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn revoke_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Set every bit in `offsets` of the bitmap at `key`, in one batched round-trip.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn set_bits(
        &self,
        key: &str,
        offsets: &[u64],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Read every bit in `offsets` of the bitmap at `key`, in one batched round-trip.
    ///
    /// The returned vector has one entry per offset, in order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn get_bits(
        &self,
        key: &str,
        offsets: &[u64],
    ) -> impl Future<Output = Result<Vec<bool>, StoreError>> + Send;

    /// Get the string value at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Set `key` to `value` without expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Set `key` to `value` with an expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete `key`. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;
}
