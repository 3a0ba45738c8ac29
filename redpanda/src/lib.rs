//! Redpanda order bus for the flash sale pipeline.
//!
//! This crate provides a Redpanda-based implementation of the [`OrderBus`]
//! trait from `flash-sale-core`. It uses rdkafka, so any Kafka-compatible
//! broker works.
//!
//! # Delivery Semantics
//!
//! **Durable publish**: `publish` resolves only after the broker acknowledged
//! the record with the configured `acks` (default `"all"`). The purchase path
//! reports an order id to the buyer only after that.
//!
//! **At-least-once delivery** with manual offset commits:
//! - A record's offset is committed only after the consumer calls [`Delivery::ack`]
//! - A delivery dropped without ack rewinds the partition to that record, so it
//!   is handed out again
//! - Records are keyed by voucher id, so one voucher's orders stay in one partition
//! - Undecodable records are surfaced as [`OrderBusError::Undecodable`] with
//!   their raw bytes, partition and offset, then committed so they cannot block
//!   the partition
//!
//! **Publish errors** distinguish a refusal by the local client
//! ([`OrderBusError::Rejected`]: queue full, oversized record, unknown topic or
//! partition) from a delivery whose outcome is unknown
//! ([`OrderBusError::PublishFailed`]: timeouts and broker errors).
//!
//! # Example
//!
//! ```no_run
//! use flash_sale_redpanda::RedpandaOrderBus;
//! use flash_sale_core::order_bus::OrderBus;
//! use flash_sale_core::types::{OrderId, OrderMessage, UserId, VoucherId};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedpandaOrderBus::builder()
//!     .brokers("localhost:9092")
//!     .topic("seckill.orders")
//!     .consumer_group("voucher-order-workers")
//!     .build()?;
//!
//! bus.publish(&OrderMessage::new(UserId(7), VoucherId(1), OrderId(42))).await?;
//!
//! let mut deliveries = bus.subscribe().await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("order {}", delivery.message().order_id);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use flash_sale_core::order_bus::{
    Delivery, DeliveryStream, OrderBus, OrderBusError, PublishAck,
};
use flash_sale_core::types::OrderMessage;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Offset;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default topic for order messages.
pub const DEFAULT_TOPIC: &str = "seckill.orders";

/// Default consumer group of the order workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "voucher-order-workers";

/// Encode an order message for the wire.
///
/// # Errors
///
/// Returns [`OrderBusError::SerializationFailed`] if encoding fails.
pub fn encode_message(message: &OrderMessage) -> Result<Vec<u8>, OrderBusError> {
    bincode::serialize(message)
        .map_err(|e| OrderBusError::SerializationFailed(format!("Failed to encode order: {e}")))
}

/// Decode an order message from the wire.
///
/// # Errors
///
/// Returns [`OrderBusError::SerializationFailed`] if the payload is not an order message.
pub fn decode_message(payload: &[u8]) -> Result<OrderMessage, OrderBusError> {
    bincode::deserialize(payload)
        .map_err(|e| OrderBusError::SerializationFailed(format!("Failed to decode order: {e}")))
}

/// Classify a failed send.
///
/// Only codes the client raises before the record leaves its queue prove the
/// record was never written.
#[must_use]
pub fn publish_error(topic: &str, error: &KafkaError) -> OrderBusError {
    let refused_locally = matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::UnknownTopic
        )
    );

    if refused_locally {
        OrderBusError::Rejected {
            topic: topic.to_string(),
            reason: error.to_string(),
        }
    } else {
        OrderBusError::PublishFailed {
            topic: topic.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Redpanda order bus.
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Topic**: Where order messages live (default: `seckill.orders`)
/// - **Consumer group**: Workers sharing the topic (default: `voucher-order-workers`)
/// - **Producer acks**: `"all"` by default so an acknowledged order survives a broker loss
/// - **Offset reset**: `"earliest"` so a fresh group never skips admitted orders
pub struct RedpandaOrderBus {
    /// Kafka producer for publishing order messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Order topic
    topic: String,
    /// Producer timeout
    timeout: Duration,
    /// Consumer group ID
    consumer_group: String,
    /// Auto offset reset policy
    auto_offset_reset: String,
}

impl RedpandaOrderBus {
    /// Create a bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OrderBusError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, OrderBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedpandaOrderBusBuilder {
        RedpandaOrderBusBuilder::default()
    }

    /// The order topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The consumer group.
    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }
}

/// Builder for configuring a [`RedpandaOrderBus`].
#[derive(Default)]
pub struct RedpandaOrderBusBuilder {
    brokers: Option<String>,
    topic: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaOrderBusBuilder {
    /// Set the broker addresses (comma-separated, e.g. "localhost:9092").
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the order topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the producer acknowledgment mode: "1" (leader ack) or "all" (all replicas ack).
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set where a new consumer group starts reading: "earliest" or "latest".
    ///
    /// Default: "earliest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaOrderBus`].
    ///
    /// # Errors
    ///
    /// Returns [`OrderBusError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaOrderBus, OrderBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| OrderBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| OrderBusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let topic = self.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            topic = %topic,
            consumer_group = %consumer_group,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaOrderBus created successfully"
        );

        Ok(RedpandaOrderBus {
            producer,
            brokers,
            topic,
            timeout,
            consumer_group,
            auto_offset_reset,
        })
    }
}

impl OrderBus for RedpandaOrderBus {
    fn publish(
        &self,
        message: &OrderMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, OrderBusError>> + Send + '_>> {
        let message = message.clone();

        Box::pin(async move {
            let payload = encode_message(&message)?;
            // One voucher, one partition.
            let key = message.voucher_id.to_string();

            let record = FutureRecord::to(&self.topic).payload(&payload).key(&key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %self.topic,
                        partition,
                        offset,
                        order_id = %message.order_id,
                        attempt = message.attempt,
                        "Order message published"
                    );
                    Ok(PublishAck { partition, offset })
                }
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %self.topic,
                        order_id = %message.order_id,
                        error = %kafka_error,
                        "Failed to publish order message"
                    );
                    Err(publish_error(&self.topic, &kafka_error))
                }
            }
        })
    }

    #[allow(clippy::too_many_lines)] // Manual commit and rewind live in one loop
    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, OrderBusError>> + Send + '_>> {
        let brokers = self.brokers.clone();
        let topic = self.topic.clone();
        let consumer_group = self.consumer_group.clone();
        let auto_offset_reset = self.auto_offset_reset.clone();

        Box::pin(async move {
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| OrderBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| OrderBusError::SubscriptionFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to subscribe to topic: {e}"),
                })?;

            tracing::info!(
                topic = %topic,
                consumer_group = %consumer_group,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to order topic"
            );

            // One delivery in flight per subscription: the next record is not
            // fetched until the current one is acked or dropped.
            let (tx, mut rx) = tokio::sync::mpsc::channel(1);

            tokio::spawn(async move {
                use futures::StreamExt;
                use rdkafka::consumer::CommitMode;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    let message = match msg_result {
                        Ok(message) => message,
                        Err(e) => {
                            let err = OrderBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let payload = message.payload().unwrap_or_default();
                    let order = match decode_message(payload) {
                        Ok(order) => order,
                        Err(err) => {
                            tracing::warn!(
                                partition = message.partition(),
                                offset = message.offset(),
                                payload_len = payload.len(),
                                error = %err,
                                "Undecodable order record, handing it over for inspection"
                            );
                            let undecodable = OrderBusError::Undecodable {
                                partition: message.partition(),
                                offset: message.offset(),
                                payload: payload.to_vec(),
                                reason: err.to_string(),
                            };
                            if tx.send(Err(undecodable)).await.is_err() {
                                break;
                            }
                            if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(error = %e, "Failed to commit undecodable record");
                            }
                            continue;
                        }
                    };

                    let (ack_tx, ack_rx) = oneshot::channel();
                    if tx.send(Ok(Delivery::new(order, ack_tx))).await.is_err() {
                        tracing::debug!("Delivery receiver dropped, exiting consumer task");
                        break;
                    }

                    if ack_rx.await.is_ok() {
                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                            tracing::warn!(
                                partition = message.partition(),
                                offset = message.offset(),
                                error = %e,
                                "Failed to commit offset (message may be redelivered)"
                            );
                        }
                    } else {
                        tracing::warn!(
                            partition = message.partition(),
                            offset = message.offset(),
                            "Delivery dropped without ack, rewinding for redelivery"
                        );
                        if let Err(e) = consumer.seek(
                            message.topic(),
                            message.partition(),
                            Offset::Offset(message.offset()),
                            Timeout::After(Duration::from_secs(5)),
                        ) {
                            tracing::error!(
                                error = %e,
                                "Failed to rewind partition, leaving consumer task so the group rebalances"
                            );
                            break;
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
