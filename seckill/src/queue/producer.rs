//! Order message producer.

use flash_sale_core::order_bus::{OrderBus, OrderBusError, PublishAck};
use flash_sale_core::retry::{RetryPolicy, retry_with_backoff};
use flash_sale_core::types::OrderMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Publishes order messages, retrying transient broker failures.
#[derive(Clone)]
pub struct OrderProducer {
    bus: Arc<dyn OrderBus>,
    policy: RetryPolicy,
}

impl OrderProducer {
    /// Create a producer with the default policy (3 attempts, exponential backoff).
    #[must_use]
    pub fn new(bus: Arc<dyn OrderBus>) -> Self {
        Self {
            bus,
            policy: RetryPolicy::default(),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish `message` and wait for the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the last [`OrderBusError`] once the attempt budget is spent, or
    /// immediately for errors retrying cannot fix. The error proves nothing was
    /// enqueued only if that holds for every attempt.
    pub async fn publish(&self, message: &OrderMessage) -> Result<PublishAck, OrderBusError> {
        let maybe_enqueued = AtomicBool::new(false);
        let unconfirmed = &maybe_enqueued;
        let bus = &self.bus;

        let result = retry_with_backoff(
            self.policy.clone(),
            move || async move {
                let result = bus.publish(message).await;
                if result.as_ref().is_err_and(|e| !e.proves_not_enqueued()) {
                    unconfirmed.store(true, Ordering::Relaxed);
                }
                result
            },
            is_transient,
        )
        .await;

        let ack = match result {
            Ok(ack) => ack,
            Err(OrderBusError::Rejected { topic, reason })
                if maybe_enqueued.load(Ordering::Relaxed) =>
            {
                return Err(OrderBusError::PublishFailed {
                    topic,
                    reason: format!("earlier attempt unconfirmed, then rejected: {reason}"),
                });
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(
            order_id = %message.order_id,
            voucher_id = %message.voucher_id,
            attempt = message.attempt,
            partition = ack.partition,
            offset = ack.offset,
            "Order message published"
        );
        Ok(ack)
    }
}

/// Whether a publish error may go away on its own.
const fn is_transient(error: &OrderBusError) -> bool {
    !matches!(error, OrderBusError::SerializationFailed(_))
}
