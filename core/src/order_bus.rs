//! Durable order channel between admission and persistence.
//!
//! This module provides the [`OrderBus`] trait that decouples the fast admission
//! path from durable order persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  try_purchase    │
//! └────────┬─────────┘
//!          │ admitted
//!          ▼
//! ┌──────────────────┐
//! │ 1. Publish       │◄─── Blocks until the broker acknowledges
//! │    OrderMessage  │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ 2. Deliver to    │◄─── At-least-once, one consumer of the group at a time
//! │    consumer      │
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ 3. Idempotent    │
//! │    persist + ack │◄─── Only acknowledged deliveries are committed
//! └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **Durable before visible**: the caller reports an order id only after `publish` resolves
//! - **At-least-once delivery**: a delivery that is dropped without [`Delivery::ack`] is redelivered
//! - **Idempotency**: consumers must tolerate the same message more than once
//! - **Ordered within partition**: messages are keyed by voucher id
//!
//! # Implementations
//!
//! - `InMemoryOrderBus` in `flash-sale-testing` - for tests
//! - `RedpandaOrderBus` in `flash-sale-redpanda` - for production (Kafka-compatible)

use crate::types::OrderMessage;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during order bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker did not acknowledge a published message
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to join the consumer group
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed to subscribe
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// A payload could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The client refused the message before it reached the broker
    #[error("Publish rejected for topic '{topic}': {reason}")]
    Rejected {
        /// The topic the message was meant for
        topic: String,
        /// The reason for rejection
        reason: String,
    },

    /// A record on the topic is not an order message
    #[error("Undecodable record at partition {partition} offset {offset}: {reason}")]
    Undecodable {
        /// Partition of the record
        partition: i32,
        /// Offset of the record
        offset: i64,
        /// The raw payload, empty if the record had none
        payload: Vec<u8>,
        /// Why decoding failed
        reason: String,
    },
}

impl OrderBusError {
    /// Whether this publish error proves the message was never enqueued.
    ///
    /// Timeouts and broker errors leave the outcome unknown: the record may
    /// have been written even though its acknowledgement was lost.
    #[must_use]
    pub const fn proves_not_enqueued(&self) -> bool {
        matches!(self, Self::SerializationFailed(_) | Self::Rejected { .. })
    }
}

/// Broker acknowledgement of a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublishAck {
    /// Partition the message landed in
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// One delivery of an [`OrderMessage`] to a consumer.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves it
/// unacknowledged: the channel will hand it out again.
#[derive(Debug)]
pub struct Delivery {
    message: OrderMessage,
    acker: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Create a delivery whose acknowledgement is reported on `acker`.
    #[must_use]
    pub const fn new(message: OrderMessage, acker: oneshot::Sender<()>) -> Self {
        Self {
            message,
            acker: Some(acker),
        }
    }

    /// Create a delivery that needs no acknowledgement.
    #[must_use]
    pub const fn detached(message: OrderMessage) -> Self {
        Self {
            message,
            acker: None,
        }
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &OrderMessage {
        &self.message
    }

    /// Acknowledge the delivery so the channel can commit past it.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            // A closed receiver means the channel already gave up on this delivery.
            let _ = acker.send(());
        }
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, OrderBusError>> + Send>>;

/// Trait for order channel implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so that services can hold an `Arc<dyn OrderBus>`.
pub trait OrderBus: Send + Sync {
    /// Publish a message and wait for the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBusError::PublishFailed`] if the broker rejects or times out.
    fn publish(
        &self,
        message: &OrderMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, OrderBusError>> + Send + '_>>;

    /// Join the consumer group and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBusError::SubscriptionFailed`] if the subscription cannot be created.
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, OrderBusError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderId, UserId, VoucherId};

    fn message() -> OrderMessage {
        OrderMessage::new(UserId(7), VoucherId(3), OrderId(99))
    }

    #[tokio::test]
    async fn ack_is_reported() {
        let (tx, rx) = oneshot::channel();
        Delivery::new(message(), tx).ack();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_delivery_is_not_acknowledged() {
        let (tx, rx) = oneshot::channel();
        drop(Delivery::new(message(), tx));
        assert!(rx.await.is_err());
    }

    #[test]
    fn only_refusals_before_the_broker_prove_nothing_was_enqueued() {
        let rejected = OrderBusError::Rejected {
            topic: "orders".into(),
            reason: "queue full".into(),
        };
        let timed_out = OrderBusError::PublishFailed {
            topic: "orders".into(),
            reason: "message timed out".into(),
        };

        assert!(rejected.proves_not_enqueued());
        assert!(OrderBusError::SerializationFailed("bad".into()).proves_not_enqueued());
        assert!(!timed_out.proves_not_enqueued());
        assert!(!OrderBusError::TransportError("reset".into()).proves_not_enqueued());
    }
}
