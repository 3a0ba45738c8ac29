//! Globally unique order ids.
//!
//! An id is `seconds since 2022-01-01T00:00:00Z` in the high 32 bits and a
//! per-scope, per-day counter from the shared store in the low 32 bits:
//!
//! ```text
//!  63                              32 31                               0
//! ┌──────────────────────────────────┬──────────────────────────────────┐
//! │        seconds since epoch       │      INCR icr:{scope}:{day}      │
//! └──────────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! The timestamp dominates ordering, so ids from calls ordered in real time
//! never decrease; the counter makes ids minted in the same second distinct.

use chrono::{DateTime, Utc};
use flash_sale_core::environment::Clock;
use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::types::OrderId;
use std::sync::Arc;
use thiserror::Error;

/// Custom epoch: 2022-01-01T00:00:00Z, in Unix seconds.
pub const EPOCH_SECONDS: i64 = 1_640_995_200;

/// Width of the counter part of an id.
pub const COUNTER_BITS: u32 = 32;

/// Errors from id generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// The counter could not be incremented
    #[error("Sequence generator unavailable: {0}")]
    GeneratorUnavailable(#[from] StoreError),

    /// The clock reads earlier than the custom epoch
    #[error("Clock is before the id epoch: {0}")]
    ClockBeforeEpoch(DateTime<Utc>),

    /// More ids were requested for one scope in one day than the counter can hold
    #[error("Daily counter for scope '{scope}' overflowed")]
    CounterOverflow {
        /// Scope whose counter overflowed
        scope: String,
    },
}

/// Counter key for `scope` on the day of `now`.
#[must_use]
pub fn counter_key(scope: &str, now: DateTime<Utc>) -> String {
    format!("icr:{scope}:{}", now.format("%Y:%m:%d"))
}

/// Compose an id from its parts.
///
/// # Errors
///
/// - [`SequenceError::ClockBeforeEpoch`] if `now` precedes the epoch
/// - [`SequenceError::CounterOverflow`] if `count` does not fit in 32 bits
pub fn compose_id(now: DateTime<Utc>, count: u64, scope: &str) -> Result<OrderId, SequenceError> {
    let seconds = u64::try_from(now.timestamp() - EPOCH_SECONDS)
        .map_err(|_| SequenceError::ClockBeforeEpoch(now))?;
    if count >> COUNTER_BITS != 0 {
        return Err(SequenceError::CounterOverflow {
            scope: scope.to_string(),
        });
    }
    Ok(OrderId((seconds << COUNTER_BITS) | count))
}

/// Order-id generator backed by the shared store's atomic counters.
pub struct SequenceGenerator<K, C> {
    store: Arc<K>,
    clock: C,
}

impl<K: KeyValueStore, C: Clock> SequenceGenerator<K, C> {
    /// Create a generator.
    #[must_use]
    pub const fn new(store: Arc<K>, clock: C) -> Self {
        Self { store, clock }
    }

    /// Mint the next id for `scope`.
    ///
    /// Ids are never synthesized locally: if the counter is unreachable the call fails.
    ///
    /// # Errors
    ///
    /// See [`SequenceError`].
    pub async fn next_id(&self, scope: &str) -> Result<OrderId, SequenceError> {
        let now = self.clock.now();
        if now.timestamp() < EPOCH_SECONDS {
            return Err(SequenceError::ClockBeforeEpoch(now));
        }

        let count = self.store.increment(&counter_key(scope, now)).await?;
        let id = compose_id(now, count, scope)?;

        tracing::debug!(scope, order_id = %id, "Order id minted");
        Ok(id)
    }
}
