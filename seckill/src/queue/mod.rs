//! The order queue between admission and durable persistence.
//!
//! - **`producer`**: publishes order messages with bounded retry
//! - **`consumer`**: idempotently persists deliveries, redelivers failures and
//!   dead-letters messages that keep failing
//!
//! Delivery is at-least-once. Correctness under duplicates rests on the
//! persist procedure: a message whose order already exists changes nothing.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerError, Disposition, OrderConsumer};
pub use producer::OrderProducer;
