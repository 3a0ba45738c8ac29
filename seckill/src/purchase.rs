//! The purchase entry point.
//!
//! `try_purchase` is the synchronous half of the pipeline. It answers as soon
//! as the order message is durably on the bus, before any database work:
//!
//! 1. sale-window gate
//! 2. atomic admission (stock and buyer check)
//! 3. mint the order id
//! 4. publish the order message
//!
//! If step 3 fails, or step 4 fails in a way that proves nothing reached the
//! bus, the admission is revoked so the unit goes back on sale and the buyer
//! can try again. Any other publish failure leaves the message possibly on the
//! bus: the unit stays held and the buyer gets [`PurchaseError::Unconfirmed`]
//! with the order id a consumer may still persist.

use crate::admission::AdmissionSequencer;
use crate::queue::OrderProducer;
use crate::sequence::SequenceGenerator;
use flash_sale_core::environment::Clock;
use flash_sale_core::kv::KeyValueStore;
use flash_sale_core::types::{
    AdmissionOutcome, OrderId, OrderMessage, SalePhase, UserId, Voucher, VoucherId,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Scope of the order id counter.
pub const ORDER_ID_SCOPE: &str = "order";

/// Why a purchase was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// The voucher was never registered
    UnknownVoucher,
    /// The sale has not opened yet
    NotStarted,
    /// The sale is over
    Ended,
    /// No stock left
    StockExhausted,
    /// The user already bought this voucher
    DuplicateUser,
}

impl DenialReason {
    /// Label used for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownVoucher => "unknown_voucher",
            Self::NotStarted => "not_started",
            Self::Ended => "ended",
            Self::StockExhausted => "stock_exhausted",
            Self::DuplicateUser => "duplicate_user",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`PurchaseService::try_purchase`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    /// The attempt was refused; nothing changed
    #[error("Purchase denied: {0}")]
    Denied(DenialReason),

    /// Infrastructure failed; the buyer may retry
    #[error("Purchase unavailable: {0}")]
    Unavailable(String),

    /// The order message may be on the bus; the unit stays held under this id
    #[error("Order {0} is unconfirmed")]
    Unconfirmed(OrderId),
}

/// Flash-sale purchase service.
pub struct PurchaseService<K, C> {
    admission: AdmissionSequencer<K>,
    ids: SequenceGenerator<K, Arc<C>>,
    producer: OrderProducer,
    clock: Arc<C>,
}

impl<K: KeyValueStore, C: Clock> PurchaseService<K, C> {
    /// Create a purchase service.
    #[must_use]
    pub fn new(store: Arc<K>, producer: OrderProducer, clock: Arc<C>) -> Self {
        Self {
            admission: AdmissionSequencer::new(Arc::clone(&store)),
            ids: SequenceGenerator::new(store, Arc::clone(&clock)),
            producer,
            clock,
        }
    }

    /// The admission gate, for operational reads such as remaining stock.
    #[must_use]
    pub const fn admission(&self) -> &AdmissionSequencer<K> {
        &self.admission
    }

    /// Make a voucher purchasable: load its stock and sale window.
    ///
    /// # Errors
    ///
    /// Returns [`PurchaseError::Unavailable`] if the store is unreachable.
    pub async fn register_voucher(&self, voucher: &Voucher) -> Result<(), PurchaseError> {
        self.admission
            .preload(voucher)
            .await
            .map_err(|e| PurchaseError::Unavailable(e.to_string()))
    }

    /// Try to buy one unit of `voucher_id` for `user_id`.
    ///
    /// On success the order id is final and the order will be persisted
    /// asynchronously.
    ///
    /// # Errors
    ///
    /// - [`PurchaseError::Denied`] for sale-window, stock and duplicate refusals
    /// - [`PurchaseError::Unavailable`] for infrastructure failures
    /// - [`PurchaseError::Unconfirmed`] when the publish outcome is unknown
    pub async fn try_purchase(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<OrderId, PurchaseError> {
        let result = self.purchase(voucher_id, user_id).await;

        let label = match &result {
            Ok(_) => "ordered",
            Err(PurchaseError::Denied(reason)) => reason.as_str(),
            Err(PurchaseError::Unavailable(_)) => "unavailable",
            Err(PurchaseError::Unconfirmed(_)) => "unconfirmed",
        };
        metrics::counter!("flash_sale.purchases", "result" => label).increment(1);

        result
    }

    async fn purchase(&self, voucher_id: VoucherId, user_id: UserId) -> Result<OrderId, PurchaseError> {
        let window = self
            .admission
            .sale_window(voucher_id)
            .await
            .map_err(|e| PurchaseError::Unavailable(e.to_string()))?
            .ok_or(PurchaseError::Denied(DenialReason::UnknownVoucher))?;

        match window.phase(self.clock.now()) {
            SalePhase::NotStarted => return Err(PurchaseError::Denied(DenialReason::NotStarted)),
            SalePhase::Ended => return Err(PurchaseError::Denied(DenialReason::Ended)),
            SalePhase::Open => {}
        }

        let outcome = self
            .admission
            .try_admit(voucher_id, user_id)
            .await
            .map_err(|e| PurchaseError::Unavailable(e.to_string()))?;
        match outcome {
            AdmissionOutcome::Admitted => {}
            AdmissionOutcome::StockExhausted => {
                return Err(PurchaseError::Denied(DenialReason::StockExhausted));
            }
            AdmissionOutcome::DuplicateUser => {
                return Err(PurchaseError::Denied(DenialReason::DuplicateUser));
            }
        }

        let order_id = match self.ids.next_id(ORDER_ID_SCOPE).await {
            Ok(id) => id,
            Err(e) => {
                self.compensate(voucher_id, user_id).await;
                return Err(PurchaseError::Unavailable(e.to_string()));
            }
        };

        let message = OrderMessage::new(user_id, voucher_id, order_id);
        if let Err(e) = self.producer.publish(&message).await {
            if e.proves_not_enqueued() {
                self.compensate(voucher_id, user_id).await;
                return Err(PurchaseError::Unavailable(e.to_string()));
            }
            tracing::error!(
                voucher_id = %voucher_id,
                user_id = %user_id,
                order_id = %order_id,
                error = %e,
                "Publish outcome unknown, unit held for reconciliation"
            );
            return Err(PurchaseError::Unconfirmed(order_id));
        }

        tracing::info!(
            voucher_id = %voucher_id,
            user_id = %user_id,
            order_id = %order_id,
            "Purchase admitted"
        );
        Ok(order_id)
    }

    async fn compensate(&self, voucher_id: VoucherId, user_id: UserId) {
        if let Err(e) = self.admission.revoke(voucher_id, user_id).await {
            tracing::error!(
                voucher_id = %voucher_id,
                user_id = %user_id,
                error = %e,
                "Failed to revoke admission, one unit is held until reconciled"
            );
        }
    }
}
