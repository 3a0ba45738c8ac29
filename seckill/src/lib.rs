//! # Flash Sale
//!
//! Admission pipeline for limited-stock flash sales.
//!
//! The synchronous half ([`purchase::PurchaseService`]) decides each attempt
//! against the key-value store alone and hands admitted orders to the order
//! bus. The asynchronous half ([`queue::OrderConsumer`]) persists them
//! idempotently, redelivering on failure and dead-lettering what cannot be
//! persisted.
//!
//! Supporting pieces:
//!
//! - [`lock::DistributedMutex`]: owner-checked mutual exclusion with expiry
//! - [`sequence::SequenceGenerator`]: time-ordered 64-bit order ids
//! - [`admission::AdmissionSequencer`]: atomic stock and one-per-user check
//! - [`bloom::MembershipFilter`]: shields reads of ids that never existed
//! - [`cache::CacheAside`]: cache reads rebuilt by a single caller
//! - [`shop::ShopService`]: the shop read path built from the two above
//!
//! ## Example
//!
//! ```ignore
//! let producer = OrderProducer::new(bus.clone());
//! let service = PurchaseService::new(store, producer, Arc::new(SystemClock));
//!
//! service.register_voucher(&voucher).await?;
//! let order_id = service.try_purchase(voucher.id, UserId(7)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod bloom;
pub mod cache;
pub mod config;
pub mod lock;
pub mod metrics;
pub mod purchase;
pub mod queue;
pub mod sequence;
pub mod shop;

pub use admission::AdmissionSequencer;
pub use bloom::{BloomFilterParams, FilterError, MembershipFilter};
pub use cache::{CacheAside, CacheError};
pub use config::Config;
pub use lock::{DistributedMutex, LockError, LockToken};
pub use purchase::{DenialReason, PurchaseError, PurchaseService};
pub use queue::{ConsumerError, Disposition, OrderConsumer, OrderProducer};
pub use sequence::{SequenceError, SequenceGenerator};
pub use shop::{ShopError, ShopService};
