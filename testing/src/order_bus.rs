//! In-memory order bus.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flash_sale_core::order_bus::{
    Delivery, DeliveryStream, OrderBus, OrderBusError, PublishAck,
};
use flash_sale_core::types::OrderMessage;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};

const TOPIC: &str = "in-memory-orders";

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<VecDeque<OrderMessage>>,
    published: Mutex<Vec<OrderMessage>>,
    ready: Notify,
    offset: AtomicI64,
    failing_publishes: AtomicU32,
    rejected_publishes: AtomicU32,
    lost_acks: AtomicU32,
    closed: AtomicBool,
    acknowledged: AtomicUsize,
    redelivered: AtomicUsize,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Shared {
    fn enqueue_front(&self, message: OrderMessage) {
        self.queue.lock().unwrap().push_front(message);
        self.ready.notify_one();
    }

    /// Wait for the next queued message, or `None` once the bus is closed and drained.
    async fn next_message(&self) -> Option<OrderMessage> {
        loop {
            let mut notified = std::pin::pin!(self.ready.notified());
            notified.as_mut().enable();

            let next = self.queue.lock().unwrap().pop_front();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }
}

/// In-memory [`OrderBus`] with consumer-group semantics.
///
/// All subscribers compete for one shared queue, so each message is handed to
/// exactly one of them at a time. A [`Delivery`] that is dropped without being
/// acknowledged is put back at the head of the queue, like an uncommitted
/// offset after a consumer restart.
///
/// # Example
///
/// ```
/// use flash_sale_testing::InMemoryOrderBus;
/// use flash_sale_core::order_bus::OrderBus;
/// use flash_sale_core::types::{OrderId, OrderMessage, UserId, VoucherId};
/// use futures::StreamExt;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryOrderBus::new();
/// bus.publish(&OrderMessage::new(UserId(1), VoucherId(2), OrderId(3))).await?;
///
/// let mut deliveries = bus.subscribe().await?;
/// let delivery = deliveries.next().await.ok_or("stream ended")??;
/// assert_eq!(delivery.message().order_id, OrderId(3));
/// delivery.ack();
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderBus {
    shared: Arc<Shared>,
}

impl InMemoryOrderBus {
    /// Create a new empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail without enqueuing anything.
    ///
    /// The error is a [`OrderBusError::PublishFailed`], which does not tell
    /// the caller whether the message was enqueued.
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` publishes fail with [`OrderBusError::Rejected`],
    /// enqueuing nothing.
    pub fn reject_next_publishes(&self, count: u32) {
        self.shared.rejected_publishes.store(count, Ordering::SeqCst);
    }

    /// Enqueue the next `count` messages but report
    /// [`OrderBusError::PublishFailed`], like a broker ack lost in transit.
    pub fn lose_next_publish_acks(&self, count: u32) {
        self.shared.lost_acks.store(count, Ordering::SeqCst);
    }

    /// Stop the bus. Subscriptions end once the queue is drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.ready.notify_waiters();
    }

    /// Every message accepted by `publish`, in order (including republished retries)
    #[must_use]
    pub fn published(&self) -> Vec<OrderMessage> {
        self.shared.published.lock().unwrap().clone()
    }

    /// Messages waiting to be delivered
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Number of deliveries acknowledged by consumers
    #[must_use]
    pub fn acknowledged(&self) -> usize {
        self.shared.acknowledged.load(Ordering::SeqCst)
    }

    /// Number of deliveries that were dropped unacknowledged and requeued
    #[must_use]
    pub fn redelivered(&self) -> usize {
        self.shared.redelivered.load(Ordering::SeqCst)
    }

    fn try_publish(&self, message: &OrderMessage) -> Result<PublishAck, OrderBusError> {
        if take_one(&self.shared.rejected_publishes) {
            return Err(OrderBusError::Rejected {
                topic: TOPIC.to_string(),
                reason: "injected rejection".to_string(),
            });
        }
        if take_one(&self.shared.failing_publishes) {
            return Err(OrderBusError::PublishFailed {
                topic: TOPIC.to_string(),
                reason: "injected publish failure".to_string(),
            });
        }

        self.shared.published.lock().unwrap().push(message.clone());
        self.shared.queue.lock().unwrap().push_back(message.clone());
        self.shared.ready.notify_one();

        if take_one(&self.shared.lost_acks) {
            return Err(OrderBusError::PublishFailed {
                topic: TOPIC.to_string(),
                reason: "injected ack loss".to_string(),
            });
        }

        Ok(PublishAck {
            partition: 0,
            offset: self.shared.offset.fetch_add(1, Ordering::SeqCst),
        })
    }
}

impl OrderBus for InMemoryOrderBus {
    fn publish(
        &self,
        message: &OrderMessage,
    ) -> Pin<Box<dyn Future<Output = Result<PublishAck, OrderBusError>> + Send + '_>> {
        let result = self.try_publish(message);
        Box::pin(async move { result })
    }

    fn subscribe(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, OrderBusError>> + Send + '_>> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            let stream = async_stream::stream! {
                while let Some(message) = shared.next_message().await {
                    let (tx, rx) = oneshot::channel();
                    let watcher = Arc::clone(&shared);
                    let requeued = message.clone();
                    tokio::spawn(async move {
                        if rx.await.is_ok() {
                            watcher.acknowledged.fetch_add(1, Ordering::SeqCst);
                        } else {
                            tracing::debug!(order_id = %requeued.order_id, "Delivery dropped unacknowledged, requeueing");
                            watcher.redelivered.fetch_add(1, Ordering::SeqCst);
                            watcher.enqueue_front(requeued);
                        }
                    });

                    yield Ok(Delivery::new(message, tx));
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}
