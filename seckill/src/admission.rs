//! The atomic admission decision.
//!
//! Admission is the only gate against overselling and duplicate purchases. It
//! runs as one server-side script per attempt, so the store's execution order
//! is the order in which buyers are served.

use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::types::{AdmissionOutcome, SaleWindow, UserId, Voucher, VoucherId};
use std::sync::Arc;

/// Key of a voucher's remaining admission stock.
#[must_use]
pub fn stock_key(voucher_id: VoucherId) -> String {
    format!("seckill:stock:{voucher_id}")
}

/// Key of the set of users admitted for a voucher.
#[must_use]
pub fn buyers_key(voucher_id: VoucherId) -> String {
    format!("seckill:order:{voucher_id}")
}

/// Key of a voucher's sale window.
#[must_use]
pub fn window_key(voucher_id: VoucherId) -> String {
    format!("seckill:window:{voucher_id}")
}

/// Admission gate over the shared store.
pub struct AdmissionSequencer<K> {
    store: Arc<K>,
}

impl<K> Clone for AdmissionSequencer<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<K: KeyValueStore> AdmissionSequencer<K> {
    /// Create a sequencer.
    #[must_use]
    pub const fn new(store: Arc<K>) -> Self {
        Self { store }
    }

    /// Decide one purchase attempt.
    ///
    /// On [`AdmissionOutcome::Admitted`] one unit of stock has been taken and
    /// `user_id` recorded as a buyer, atomically. No order exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable; nothing changed then.
    pub async fn try_admit(
        &self,
        voucher_id: VoucherId,
        user_id: UserId,
    ) -> Result<AdmissionOutcome, StoreError> {
        let outcome = self
            .store
            .run_admission(
                &stock_key(voucher_id),
                &buyers_key(voucher_id),
                &user_id.to_string(),
            )
            .await?;

        metrics::counter!("flash_sale.admission", "outcome" => outcome.as_str()).increment(1);
        tracing::debug!(
            voucher_id = %voucher_id,
            user_id = %user_id,
            outcome = outcome.as_str(),
            "Admission decided"
        );

        Ok(outcome)
    }

    /// Undo an admission whose order could not be handed to the queue.
    ///
    /// Removes the buyer and returns one unit of stock, only if the buyer was
    /// admitted. Returns whether anything was undone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn revoke(&self, voucher_id: VoucherId, user_id: UserId) -> Result<bool, StoreError> {
        let revoked = self
            .store
            .revoke_admission(
                &stock_key(voucher_id),
                &buyers_key(voucher_id),
                &user_id.to_string(),
            )
            .await?;

        if revoked {
            metrics::counter!("flash_sale.admission.revoked").increment(1);
            tracing::info!(voucher_id = %voucher_id, user_id = %user_id, "Admission revoked");
        }
        Ok(revoked)
    }

    /// Load a voucher's stock and sale window into the store before the sale.
    ///
    /// Overwrites any previous stock. The buyer set is left alone, so a reload
    /// never lets an earlier buyer in twice.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    pub async fn preload(&self, voucher: &Voucher) -> Result<(), StoreError> {
        let window = serde_json::to_string(&voucher.window)
            .map_err(|e| StoreError::CommandFailed(format!("Failed to encode sale window: {e}")))?;

        self.store
            .set(&stock_key(voucher.id), &voucher.stock.to_string())
            .await?;
        self.store.set(&window_key(voucher.id), &window).await?;

        tracing::info!(voucher_id = %voucher.id, stock = voucher.stock, "Voucher preloaded");
        Ok(())
    }

    /// The sale window of a preloaded voucher.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnexpectedReply`] if the stored window is corrupt.
    pub async fn sale_window(&self, voucher_id: VoucherId) -> Result<Option<SaleWindow>, StoreError> {
        let Some(raw) = self.store.get(&window_key(voucher_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::UnexpectedReply(format!("Corrupt sale window for {voucher_id}: {e}")))
    }

    /// Remaining admission stock, if the voucher was preloaded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the value is not an integer.
    pub async fn remaining_stock(&self, voucher_id: VoucherId) -> Result<Option<i64>, StoreError> {
        let key = stock_key(voucher_id);
        self.store
            .get(&key)
            .await?
            .map(|raw| {
                raw.parse()
                    .map_err(|_| StoreError::UnexpectedReply(format!("'{key}' is not an integer")))
            })
            .transpose()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use flash_sale_core::environment::Clock;
    use flash_sale_testing::{InMemoryKeyValueStore, test_clock};

    async fn sequencer(stock: u32) -> (Arc<InMemoryKeyValueStore>, AdmissionSequencer<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let sequencer = AdmissionSequencer::new(Arc::clone(&store));
        let now = test_clock().now();
        sequencer
            .preload(&Voucher {
                id: VoucherId(1),
                stock,
                window: SaleWindow::new(now, now + Duration::hours(1)),
            })
            .await
            .unwrap();
        (store, sequencer)
    }

    #[tokio::test]
    async fn last_unit_goes_to_exactly_one_buyer() {
        let (_, sequencer) = sequencer(1).await;

        let (a, b) = tokio::join!(
            sequencer.try_admit(VoucherId(1), UserId(1)),
            sequencer.try_admit(VoucherId(1), UserId(2)),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| o.code());

        assert_eq!(
            outcomes,
            vec![AdmissionOutcome::Admitted, AdmissionOutcome::StockExhausted]
        );
        assert_eq!(sequencer.remaining_stock(VoucherId(1)).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn same_user_is_admitted_once() {
        let (store, sequencer) = sequencer(10).await;

        let first = sequencer.try_admit(VoucherId(1), UserId(7)).await.unwrap();
        let second = sequencer.try_admit(VoucherId(1), UserId(7)).await.unwrap();

        assert_eq!(first, AdmissionOutcome::Admitted);
        assert_eq!(second, AdmissionOutcome::DuplicateUser);
        assert_eq!(sequencer.remaining_stock(VoucherId(1)).await.unwrap(), Some(9));
        assert_eq!(store.set_members("seckill:order:1").len(), 1);
    }

    #[tokio::test]
    async fn unknown_voucher_has_no_stock() {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let sequencer = AdmissionSequencer::new(store);

        assert_eq!(
            sequencer.try_admit(VoucherId(404), UserId(1)).await.unwrap(),
            AdmissionOutcome::StockExhausted
        );
        assert_eq!(sequencer.sale_window(VoucherId(404)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn revoke_restores_stock_and_lets_buyer_retry() {
        let (_, sequencer) = sequencer(1).await;
        sequencer.try_admit(VoucherId(1), UserId(7)).await.unwrap();

        assert!(sequencer.revoke(VoucherId(1), UserId(7)).await.unwrap());
        assert!(!sequencer.revoke(VoucherId(1), UserId(7)).await.unwrap());
        assert_eq!(sequencer.remaining_stock(VoucherId(1)).await.unwrap(), Some(1));
        assert_eq!(
            sequencer.try_admit(VoucherId(1), UserId(7)).await.unwrap(),
            AdmissionOutcome::Admitted
        );
    }

    #[tokio::test]
    async fn window_roundtrips_through_store() {
        let (_, sequencer) = sequencer(3).await;
        let now = test_clock().now();

        assert_eq!(
            sequencer.sale_window(VoucherId(1)).await.unwrap(),
            Some(SaleWindow::new(now, now + Duration::hours(1)))
        );
    }
}
