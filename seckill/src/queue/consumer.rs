//! Idempotent order consumer.
//!
//! `OrderConsumer` turns deliveries from the order bus into persisted orders.
//! It owns the subscribe-process-reconnect loop, bounds the time spent on each
//! delivery, and decides what happens to a delivery that fails.
//!
//! # Delivery lifecycle
//!
//! ```text
//! delivery ─► persist (bounded by processing_timeout)
//!               │
//!               ├─ Created / Duplicate / OutOfStock ─► ack
//!               │
//!               └─ error or timeout
//!                     │
//!                     ├─ attempt + 1 < max_deliveries ─► republish(attempt + 1) ─► ack
//!                     │
//!                     └─ otherwise ─► dead-letter sink ─► ack
//! ```
//!
//! A delivery is acknowledged only once its fate is durable somewhere: in the
//! order table, back on the bus, or in the dead-letter sink. If even that
//! fails the delivery is dropped unacknowledged and the bus hands it out again.
//!
//! Records that are not order messages arrive as
//! [`OrderBusError::Undecodable`] and are kept byte for byte in the
//! dead-letter sink.
//!
//! # Example
//!
//! ```rust,ignore
//! let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//!
//! let handle = OrderConsumer::new(bus, producer, store, dead_letters, SystemClock, shutdown_rx)
//!     .with_max_deliveries(3)
//!     .with_processing_timeout(Duration::from_secs(30))
//!     .spawn();
//!
//! shutdown_tx.send(())?;
//! handle.await?;
//! ```

use super::OrderProducer;
use flash_sale_core::dead_letter::{DeadLetter, DeadLetterSink, UndecodableRecord};
use flash_sale_core::environment::Clock;
use flash_sale_core::order_bus::{Delivery, DeliveryStream, OrderBus, OrderBusError};
use flash_sale_core::order_store::{OrderStore, OrderStoreError};
use flash_sale_core::types::{OrderMessage, PersistOutcome};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Errors from processing one delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The persist procedure failed
    #[error("Persist failed: {0}")]
    Persist(#[from] OrderStoreError),

    /// The persist procedure did not finish in time
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),

    /// The retry copy of a failed message could not be published
    #[error("Republish failed: {0}")]
    Republish(OrderBusError),

    /// The dead-letter sink rejected an exhausted message
    #[error("Dead-letter write failed: {0}")]
    DeadLetter(OrderStoreError),
}

/// What happened to an acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The persist procedure completed
    Persisted(PersistOutcome),
    /// Processing failed; a copy with this attempt counter was republished
    Redelivered {
        /// Attempt counter of the republished copy
        attempt: u32,
    },
    /// Processing failed on the last allowed delivery; the message was dead-lettered
    DeadLettered {
        /// Dead-letter entry id
        entry_id: i64,
    },
}

/// Consumer of the order bus.
pub struct OrderConsumer<S, D, C> {
    /// Consumer name (for logging)
    name: String,

    /// Bus to consume from
    bus: Arc<dyn OrderBus>,

    /// Producer used to republish failed messages
    producer: OrderProducer,

    /// Durable order store
    store: Arc<S>,

    /// Destination for exhausted messages
    dead_letters: Arc<D>,

    /// Time source for order creation and failure timestamps
    clock: C,

    /// Shutdown signal receiver
    shutdown: broadcast::Receiver<()>,

    /// Deliveries of one message before it is dead-lettered (default: 3)
    max_deliveries: u32,

    /// Upper bound on processing one delivery (default: 30 seconds)
    processing_timeout: Duration,

    /// Delay before resubscribing after the stream ends (default: 5 seconds)
    retry_delay: Duration,
}

impl<S, D, C> OrderConsumer<S, D, C>
where
    S: OrderStore + 'static,
    D: DeadLetterSink + 'static,
    C: Clock + 'static,
{
    /// Create a consumer with default limits.
    #[must_use]
    pub fn new(
        bus: Arc<dyn OrderBus>,
        producer: OrderProducer,
        store: Arc<S>,
        dead_letters: Arc<D>,
        clock: C,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: "voucher-orders".to_string(),
            bus,
            producer,
            store,
            dead_letters,
            clock,
            shutdown,
            max_deliveries: 3,
            processing_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set the consumer name used in logs.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set how many deliveries a message gets (values below 1 are treated as 1).
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Set the per-delivery processing bound.
    #[must_use]
    pub const fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    /// Set the resubscribe delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until a shutdown signal is received. A delivery being
    /// processed when the signal arrives is finished first.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the subscribe-process-reconnect loop until shutdown.
    pub async fn run(&mut self) {
        info!(consumer = %self.name, "Order consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Order consumer received shutdown signal");
                    break;
                }
                subscribe_result = self.bus.subscribe() => {
                    match subscribe_result {
                        Ok(mut stream) => {
                            info!(consumer = %self.name, "Subscribed to order bus");
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(consumer = %self.name, "Order stream ended, resubscribing in {:?}", self.retry_delay);
                            tokio::time::sleep(self.retry_delay).await;
                        }
                        Err(e) => {
                            error!(
                                consumer = %self.name,
                                error = %e,
                                "Failed to subscribe to order bus, retrying in {:?}",
                                self.retry_delay
                            );
                            tokio::time::sleep(self.retry_delay).await;
                        }
                    }
                }
            }
        }

        info!(consumer = %self.name, "Order consumer stopped");
    }

    /// Process deliveries until the stream ends. Returns `true` on shutdown.
    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Order consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            if let Err(e) = self.handle(delivery).await {
                                error!(consumer = %self.name, error = %e, "Delivery left unacknowledged for redelivery");
                            }
                        }
                        Some(Err(OrderBusError::Undecodable { partition, offset, payload, reason })) => {
                            self.set_aside(UndecodableRecord {
                                partition,
                                offset,
                                payload,
                                error: reason,
                                received_at: self.clock.now(),
                            })
                            .await;
                        }
                        Some(Err(e)) => {
                            error!(consumer = %self.name, error = %e, "Error receiving order message");
                        }
                        None => return false,
                    }
                }
            }
        }
    }

    async fn set_aside(&self, record: UndecodableRecord) {
        match self.dead_letters.record_undecodable(&record).await {
            Ok(entry_id) => {
                metrics::counter!("flash_sale.dlq.undecodable").increment(1);
                error!(
                    consumer = %self.name,
                    dlq_id = entry_id,
                    partition = record.partition,
                    offset = record.offset,
                    error = %record.error,
                    "Undecodable order record set aside"
                );
            }
            Err(e) => {
                error!(
                    consumer = %self.name,
                    partition = record.partition,
                    offset = record.offset,
                    payload = %hex(&record.payload),
                    error = %record.error,
                    store_error = %e,
                    "Failed to keep undecodable order record"
                );
            }
        }
    }

    /// Process one delivery and acknowledge it once its outcome is durable.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Republish`] or [`ConsumerError::DeadLetter`] when
    /// a failed message could not be handed on; the delivery is then dropped
    /// unacknowledged so the bus redelivers it.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, ConsumerError> {
        let message = delivery.message().clone();

        let failure = match tokio::time::timeout(self.processing_timeout, self.persist(&message)).await {
            Ok(Ok(outcome)) => {
                delivery.ack();
                return Ok(Disposition::Persisted(outcome));
            }
            Ok(Err(e)) => e,
            Err(_) => ConsumerError::Timeout(self.processing_timeout),
        };

        let disposition = self.retry_or_dead_letter(&message, &failure).await?;
        delivery.ack();
        Ok(disposition)
    }

    async fn persist(&self, message: &OrderMessage) -> Result<PersistOutcome, ConsumerError> {
        let order = message.to_order(self.clock.now());
        let outcome = self.store.persist_order(&order).await?;

        match outcome {
            PersistOutcome::Created => {
                metrics::counter!("flash_sale.orders.persisted").increment(1);
                info!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "Order persisted"
                );
            }
            PersistOutcome::Duplicate => {
                debug!(order_id = %order.id, "Order already persisted, skipping");
            }
            PersistOutcome::OutOfStock => {
                metrics::counter!("flash_sale.orders.anomalies").increment(1);
                warn!(
                    order_id = %order.id,
                    user_id = %order.user_id,
                    voucher_id = %order.voucher_id,
                    "Admitted order found no durable stock, dropping"
                );
            }
        }

        Ok(outcome)
    }

    async fn retry_or_dead_letter(
        &self,
        message: &OrderMessage,
        failure: &ConsumerError,
    ) -> Result<Disposition, ConsumerError> {
        let failed_deliveries = message.attempt.saturating_add(1);

        if failed_deliveries < self.max_deliveries {
            let retry = message.next_attempt();
            self.producer
                .publish(&retry)
                .await
                .map_err(ConsumerError::Republish)?;

            warn!(
                order_id = %message.order_id,
                attempt = failed_deliveries,
                max_deliveries = self.max_deliveries,
                error = %failure,
                "Order processing failed, redelivering"
            );
            return Ok(Disposition::Redelivered {
                attempt: retry.attempt,
            });
        }

        let letter = DeadLetter {
            message: message.clone(),
            error: failure.to_string(),
            attempts: failed_deliveries,
            failed_at: self.clock.now(),
        };
        let entry_id = self
            .dead_letters
            .record(&letter)
            .await
            .map_err(ConsumerError::DeadLetter)?;

        metrics::counter!("flash_sale.dlq.added").increment(1);
        error!(
            dlq_id = entry_id,
            order_id = %message.order_id,
            user_id = %message.user_id,
            voucher_id = %message.voucher_id,
            attempts = failed_deliveries,
            error = %failure,
            "Order message dead-lettered"
        );
        Ok(Disposition::DeadLettered { entry_id })
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flash_sale_core::types::{OrderId, UserId, VoucherId};
    use flash_sale_core::retry::RetryPolicy;
    use flash_sale_core::order_bus::PublishAck;
    use flash_sale_core::types::Order;
    use flash_sale_testing::{
        FixedClock, InMemoryDeadLetters, InMemoryOrderBus, InMemoryOrderStore, test_clock,
    };
    use std::future::Future;
    use std::pin::Pin;
    use tokio::sync::oneshot;

    struct Harness {
        bus: Arc<InMemoryOrderBus>,
        store: Arc<InMemoryOrderStore>,
        dead_letters: Arc<InMemoryDeadLetters>,
        consumer: OrderConsumer<InMemoryOrderStore, InMemoryDeadLetters, FixedClock>,
        _shutdown: broadcast::Sender<()>,
    }

    fn harness(stock: i64) -> Harness {
        let bus = Arc::new(InMemoryOrderBus::new());
        let store = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId(1), stock));
        let dead_letters = Arc::new(InMemoryDeadLetters::new());
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let consumer = OrderConsumer::new(
            bus.clone(),
            OrderProducer::new(bus.clone()),
            Arc::clone(&store),
            Arc::clone(&dead_letters),
            test_clock(),
            shutdown_rx,
        );
        Harness {
            bus,
            store,
            dead_letters,
            consumer,
            _shutdown: shutdown,
        }
    }

    fn delivery(message: OrderMessage) -> (Delivery, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Delivery::new(message, tx), rx)
    }

    fn message() -> OrderMessage {
        OrderMessage::new(UserId(7), VoucherId(1), OrderId(42))
    }

    #[tokio::test]
    async fn duplicate_delivery_creates_one_order() {
        let h = harness(10);

        let (first, first_ack) = delivery(message());
        let (second, second_ack) = delivery(message());

        assert_eq!(
            h.consumer.handle(first).await.unwrap(),
            Disposition::Persisted(PersistOutcome::Created)
        );
        assert_eq!(
            h.consumer.handle(second).await.unwrap(),
            Disposition::Persisted(PersistOutcome::Duplicate)
        );
        assert!(first_ack.await.is_ok());
        assert!(second_ack.await.is_ok());
        assert_eq!(h.store.orders().len(), 1);
        assert_eq!(h.store.stock(VoucherId(1)), Some(9));
    }

    #[tokio::test]
    async fn out_of_stock_is_acknowledged_and_dropped() {
        let h = harness(0);
        let (d, ack) = delivery(message());

        assert_eq!(
            h.consumer.handle(d).await.unwrap(),
            Disposition::Persisted(PersistOutcome::OutOfStock)
        );
        assert!(ack.await.is_ok());
        assert!(h.store.orders().is_empty());
    }

    #[tokio::test]
    async fn failure_is_republished_with_next_attempt() {
        let h = harness(10);
        h.store.fail_next_persists(1);
        let (d, ack) = delivery(message());

        assert_eq!(
            h.consumer.handle(d).await.unwrap(),
            Disposition::Redelivered { attempt: 1 }
        );
        assert!(ack.await.is_ok());
        assert_eq!(h.bus.published(), vec![message().next_attempt()]);
    }

    #[tokio::test]
    async fn last_delivery_failure_is_dead_lettered() {
        let h = harness(10);
        h.store.fail_next_persists(1);
        let last = message().next_attempt().next_attempt();
        let (d, ack) = delivery(last.clone());

        assert!(matches!(
            h.consumer.handle(d).await.unwrap(),
            Disposition::DeadLettered { .. }
        ));
        assert!(ack.await.is_ok());

        let letters = h.dead_letters.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message, last);
        assert_eq!(letters[0].attempts, 3);
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn failed_republish_leaves_delivery_unacknowledged() {
        let bus = Arc::new(InMemoryOrderBus::new());
        bus.fail_next_publishes(u32::MAX);
        let store = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId(1), 10));
        store.fail_next_persists(1);
        let (_tx, rx) = broadcast::channel(1);
        let consumer = OrderConsumer::new(
            bus.clone(),
            OrderProducer::new(bus.clone()).with_policy(RetryPolicy::fixed(1, Duration::ZERO)),
            store,
            Arc::new(InMemoryDeadLetters::new()),
            test_clock(),
            rx,
        );
        let (d, ack) = delivery(message());

        assert!(matches!(
            consumer.handle(d).await,
            Err(ConsumerError::Republish(_))
        ));
        assert!(ack.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_persist_times_out() {
        struct Stalled;
        impl OrderStore for Stalled {
            async fn persist_order(
                &self,
                _order: &Order,
            ) -> Result<PersistOutcome, OrderStoreError> {
                std::future::pending().await
            }
            async fn find_order(
                &self,
                _id: OrderId,
            ) -> Result<Option<Order>, OrderStoreError> {
                Ok(None)
            }
            async fn voucher_stock(&self, _id: VoucherId) -> Result<Option<i64>, OrderStoreError> {
                Ok(None)
            }
        }

        let bus = Arc::new(InMemoryOrderBus::new());
        let (_tx, rx) = broadcast::channel(1);
        let consumer = OrderConsumer::new(
            bus.clone(),
            OrderProducer::new(bus.clone()),
            Arc::new(Stalled),
            Arc::new(InMemoryDeadLetters::new()),
            test_clock(),
            rx,
        )
        .with_processing_timeout(Duration::from_secs(30));
        let (d, _ack) = delivery(message());

        assert_eq!(
            consumer.handle(d).await.unwrap(),
            Disposition::Redelivered { attempt: 1 }
        );
    }

    #[tokio::test]
    async fn undecodable_record_is_kept_with_its_position() {
        struct Poisoned;
        impl OrderBus for Poisoned {
            fn publish(
                &self,
                _message: &OrderMessage,
            ) -> Pin<Box<dyn Future<Output = Result<PublishAck, OrderBusError>> + Send + '_>> {
                Box::pin(async { Err(OrderBusError::TransportError("read only".into())) })
            }

            fn subscribe(
                &self,
            ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, OrderBusError>> + Send + '_>> {
                let poison = OrderBusError::Undecodable {
                    partition: 3,
                    offset: 77,
                    payload: vec![0xde, 0xad],
                    reason: "Serialization failed: bad tag".into(),
                };
                let stream = futures::stream::iter([Err::<Delivery, _>(poison)])
                    .chain(futures::stream::pending());
                Box::pin(async move { Ok(Box::pin(stream) as DeliveryStream) })
            }
        }

        let dead_letters = Arc::new(InMemoryDeadLetters::new());
        let bus: Arc<dyn OrderBus> = Arc::new(Poisoned);
        let (shutdown, rx) = broadcast::channel(1);
        let handle = OrderConsumer::new(
            Arc::clone(&bus),
            OrderProducer::new(bus),
            Arc::new(InMemoryOrderStore::new()),
            Arc::clone(&dead_letters),
            test_clock(),
            rx,
        )
        .spawn();

        while dead_letters.undecodable().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        let kept = dead_letters.undecodable();
        assert_eq!(kept.len(), 1);
        assert_eq!((kept[0].partition, kept[0].offset), (3, 77));
        assert_eq!(kept[0].payload, vec![0xde, 0xad]);
        assert!(dead_letters.letters().is_empty());
    }

    #[test]
    fn payload_is_logged_as_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x7f]), "00ab7f");
    }

    #[tokio::test]
    async fn spawned_consumer_stops_on_shutdown() {
        let bus = Arc::new(InMemoryOrderBus::new());
        let store = Arc::new(InMemoryOrderStore::new().with_voucher(VoucherId(1), 5));
        let (shutdown, rx) = broadcast::channel(1);
        let handle = OrderConsumer::new(
            bus.clone(),
            OrderProducer::new(bus.clone()),
            Arc::clone(&store),
            Arc::new(InMemoryDeadLetters::new()),
            test_clock(),
            rx,
        )
        .spawn();

        bus.publish(&message()).await.unwrap();
        while store.orders().is_empty() {
            tokio::task::yield_now().await;
        }
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(store.orders().len(), 1);
    }
}
