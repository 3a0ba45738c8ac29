//! # Flash Sale Core
//!
//! Core traits and types for the flash-sale admission pipeline.
//!
//! A flash sale turns a burst of purchase attempts into a small number of
//! durable orders. The hot path never touches the relational database:
//!
//! ```text
//! try_purchase ─► window check ─► atomic admission (KV store)
//!                                      │ admitted
//!                                      ▼
//!                          mint order id ─► publish to OrderBus
//!                                                 │
//!                                                 ▼
//!                           consumer ─► idempotent persist (OrderStore)
//! ```
//!
//! ## Seams
//!
//! - [`kv::KeyValueStore`]: atomic primitives of the shared key-value store
//! - [`order_bus::OrderBus`]: durable at-least-once channel for order messages
//! - [`order_store::OrderStore`]: transactional order persistence
//! - [`order_store::ShopRepository`]: rows behind the cached read path
//! - [`dead_letter::DeadLetterSink`]: where exhausted messages end up
//! - [`environment::Clock`]: injected time source
//!
//! Production implementations live in `flash-sale-redis`, `flash-sale-redpanda`
//! and `flash-sale-postgres`; in-memory doubles live in `flash-sale-testing`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use chrono::{DateTime, Utc};

pub mod dead_letter;
pub mod kv;
pub mod order_bus;
pub mod order_store;
pub mod retry;
pub mod types;

pub use types::{
    AdmissionOutcome, Order, OrderId, OrderMessage, PersistOutcome, SalePhase, SaleWindow, Shop,
    ShopId, UserId, Voucher, VoucherId,
};

/// Injected dependencies that are not I/O.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Sale windows and order ids are both derived from "now", so every
    /// component that reads time takes a `Clock` instead of calling `Utc::now`.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
        fn now(&self) -> DateTime<Utc> {
            (**self).now()
        }
    }
}
