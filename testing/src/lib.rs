//! # Flash Sale Testing
//!
//! In-memory doubles and helpers for testing the flash sale pipeline without
//! Redis, Redpanda or `PostgreSQL`.
//!
//! This crate provides:
//! - [`InMemoryKeyValueStore`]: atomic KV primitives behind one mutex
//! - [`InMemoryOrderBus`]: at-least-once channel that redelivers unacked messages
//! - [`InMemoryOrderStore`] and [`InMemoryShopRepository`]: transactional stores
//! - [`InMemoryDeadLetters`]: captures dead letters for assertions
//! - [`FixedClock`] and [`ManualClock`]: deterministic time
//!
//! ## Example
//!
//! ```ignore
//! use flash_sale_testing::{InMemoryKeyValueStore, InMemoryOrderBus, test_clock};
//!
//! #[tokio::test]
//! async fn one_unit_one_order() {
//!     let kv = Arc::new(InMemoryKeyValueStore::new());
//!     let bus = Arc::new(InMemoryOrderBus::new());
//!     let service = PurchaseService::new(kv, bus.clone(), Arc::new(test_clock()));
//!     // ...
//!     assert_eq!(bus.published().len(), 1);
//! }
//! ```

mod kv;
mod order_bus;
mod stores;

pub use kv::InMemoryKeyValueStore;
pub use order_bus::InMemoryOrderBus;
pub use stores::{InMemoryDeadLetters, InMemoryOrderStore, InMemoryShopRepository};

use chrono::{DateTime, Utc};
use flash_sale_core::environment::Clock;

/// Deterministic clocks.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use flash_sale_testing::mocks::FixedClock;
    /// use flash_sale_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and pass
    /// another into the component under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward (or backward, with a negative duration)
        #[allow(clippy::unwrap_used)]
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time
        #[allow(clippy::unwrap_used)]
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    impl Clock for ManualClock {
        #[allow(clippy::unwrap_used)]
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::collection::vec;
    use proptest::prelude::*;

    /// Purchase attempts as raw user ids, with repeats, drawn from `1..=max_user`.
    pub fn purchase_attempts(
        max_user: i64,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<i64>> {
        vec(1..=max_user, 1..=max_len)
    }

    /// Initial stock levels worth testing, including zero.
    pub fn stock_levels(max: u32) -> impl Strategy<Value = u32> {
        0..=max
    }
}

/// Install a `tracing` subscriber that writes to the test harness.
///
/// Safe to call from every test; only the first call installs it.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_clock().now());
        let handle = clock.clone();

        handle.advance(chrono::Duration::seconds(90));

        assert_eq!(clock.now(), test_clock().now() + chrono::Duration::seconds(90));
    }
}
