//! Probabilistic membership filter stored as a bitmap in the shared store.
//!
//! The filter shields the cache and the database from lookups of ids that were
//! never created: a clear bit proves absence, all set bits mean "probably present".
//!
//! # Parameters
//!
//! For `n` expected insertions and a target false-positive rate `p`:
//!
//! - `m = ceil(-n * ln(p) / ln(2)^2)` bits
//! - `k = max(1, round(m / n * ln(2)))` hash functions
//!
//! # Hashing
//!
//! Double hashing over MurmurHash3 x64-128: `g_i = (h1 + i * h2) mod m`, where
//! `h1` and `h2` are the low 64 bits of the hash under two fixed seeds. A
//! stride with `h2 mod m == 0` is bumped by one so the `k` positions never
//! collapse onto a single bit.

use flash_sale_core::kv::{KeyValueStore, StoreError};
use std::collections::BTreeSet;
use std::f64::consts::LN_2;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

/// Bitmap key of the shop filter.
pub const SHOP_FILTER_KEY: &str = "bloom:shop";

/// Largest bitmap the store can address (Redis bit offsets are below 2^32).
pub const MAX_BITS: u64 = 1 << 32;

const SEED_PRIMARY: u32 = 0;
const SEED_SECONDARY: u32 = 0x1234_ABCD;

/// Offsets written per pipelined round-trip in [`MembershipFilter::add_batch`].
const BATCH_CHUNK: usize = 4096;

/// Errors from the membership filter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Sizing inputs outside their valid range
    #[error("Invalid filter parameters: {0}")]
    InvalidParameters(String),

    /// The bitmap could not be read or written
    #[error("Filter store error: {0}")]
    Store(#[from] StoreError),
}

/// Bit-array size and hash count derived from capacity and error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomFilterParams {
    /// Number of bits (`m`)
    pub bits: u64,
    /// Number of hash functions (`k`)
    pub hashes: u32,
}

impl BloomFilterParams {
    /// Optimal parameters for `expected_items` insertions at `false_positive_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidParameters`] if `expected_items` is zero,
    /// the rate is not strictly between 0 and 1, or the bitmap would exceed
    /// [`MAX_BITS`].
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn optimal(expected_items: u64, false_positive_rate: f64) -> Result<Self, FilterError> {
        if expected_items == 0 {
            return Err(FilterError::InvalidParameters(
                "expected items must be positive".to_string(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(FilterError::InvalidParameters(format!(
                "false positive rate {false_positive_rate} must be in (0, 1)"
            )));
        }

        let n = expected_items as f64;
        let m = (-n * false_positive_rate.ln() / (LN_2 * LN_2)).ceil();
        if m > MAX_BITS as f64 {
            return Err(FilterError::InvalidParameters(format!(
                "{m} bits exceeds the bitmap limit of {MAX_BITS}"
            )));
        }
        let k = (m / n * LN_2).round().max(1.0);

        Ok(Self {
            bits: m as u64,
            hashes: k as u32,
        })
    }

    /// Bit positions of `element`.
    #[must_use]
    pub fn positions(&self, element: &[u8]) -> Vec<u64> {
        let h1 = murmur_hash(element, SEED_PRIMARY);
        let mut h2 = murmur_hash(element, SEED_SECONDARY);
        if h2 % self.bits == 0 {
            h2 = h2.wrapping_add(1);
        }

        (0..u64::from(self.hashes))
            .map(|i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
            .collect()
    }
}

/// Low 64 bits of MurmurHash3 x64-128.
#[allow(clippy::cast_possible_truncation)]
fn murmur_hash(element: &[u8], seed: u32) -> u64 {
    let mut cursor = Cursor::new(element);
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_x64_128(&mut cursor, seed).unwrap_or(0) as u64
}

/// Membership filter over a bitmap in the shared store.
pub struct MembershipFilter<K> {
    store: Arc<K>,
    key: String,
    params: BloomFilterParams,
}

impl<K> Clone for MembershipFilter<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            params: self.params,
        }
    }
}

impl<K: KeyValueStore> MembershipFilter<K> {
    /// Create a filter sized for `expected_items` at `false_positive_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidParameters`] for invalid sizing inputs.
    pub fn new(
        store: Arc<K>,
        key: impl Into<String>,
        expected_items: u64,
        false_positive_rate: f64,
    ) -> Result<Self, FilterError> {
        let params = BloomFilterParams::optimal(expected_items, false_positive_rate)?;
        let key = key.into();
        tracing::info!(
            filter = %key,
            bits = params.bits,
            hashes = params.hashes,
            "Membership filter configured"
        );
        Ok(Self { store, key, params })
    }

    /// Derived parameters.
    #[must_use]
    pub const fn params(&self) -> BloomFilterParams {
        self.params
    }

    /// Add one element.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Store`] if the bitmap cannot be written.
    pub async fn add(&self, element: &str) -> Result<(), FilterError> {
        let positions = self.params.positions(element.as_bytes());
        self.store.set_bits(&self.key, &positions).await?;
        Ok(())
    }

    /// Add many elements, writing each distinct bit once.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Store`] if the bitmap cannot be written. Chunks
    /// written before the failure stay set.
    pub async fn add_batch<I, S>(&self, elements: I) -> Result<(), FilterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let positions: BTreeSet<u64> = elements
            .into_iter()
            .flat_map(|element| self.params.positions(element.as_ref().as_bytes()))
            .collect();
        let positions: Vec<u64> = positions.into_iter().collect();

        for chunk in positions.chunks(BATCH_CHUNK) {
            self.store.set_bits(&self.key, chunk).await?;
        }

        tracing::debug!(filter = %self.key, bits = positions.len(), "Batch added to filter");
        Ok(())
    }

    /// Whether `element` may have been added. `false` is definitive.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Store`] if the bitmap cannot be read.
    pub async fn might_contain(&self, element: &str) -> Result<bool, FilterError> {
        let positions = self.params.positions(element.as_bytes());
        let bits = self.store.get_bits(&self.key, &positions).await?;
        Ok(bits.iter().all(|bit| *bit))
    }

    /// Clear every bit.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Store`] if the bitmap cannot be deleted.
    pub async fn clear(&self) -> Result<(), FilterError> {
        self.store.delete(&self.key).await?;
        tracing::info!(filter = %self.key, "Membership filter cleared");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use flash_sale_testing::InMemoryKeyValueStore;
    use proptest::prelude::*;

    fn filter(n: u64, p: f64) -> (Arc<InMemoryKeyValueStore>, MembershipFilter<InMemoryKeyValueStore>) {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let filter = MembershipFilter::new(Arc::clone(&store), SHOP_FILTER_KEY, n, p).unwrap();
        (store, filter)
    }

    #[test]
    fn production_sizing() {
        let params = BloomFilterParams::optimal(10_000_000, 0.0001).unwrap();

        assert!((191_701_168..=191_701_169).contains(&params.bits));
        assert_eq!(params.hashes, 13);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(BloomFilterParams::optimal(0, 0.01).is_err());
        assert!(BloomFilterParams::optimal(100, 0.0).is_err());
        assert!(BloomFilterParams::optimal(100, 1.0).is_err());
        assert!(BloomFilterParams::optimal(100, f64::NAN).is_err());
        assert!(BloomFilterParams::optimal(u64::MAX / 2, 0.0001).is_err());
    }

    #[test]
    fn tiny_filters_use_at_least_one_hash() {
        let params = BloomFilterParams::optimal(1, 0.9).unwrap();
        assert!(params.hashes >= 1);
        assert!(params.bits >= 1);
    }

    #[tokio::test]
    async fn added_elements_are_always_found() {
        let (_, filter) = filter(1_000, 0.01);
        filter.add("42").await.unwrap();
        filter.add_batch((100..600).map(|i| i.to_string())).await.unwrap();

        assert!(filter.might_contain("42").await.unwrap());
        for i in 100..600 {
            assert!(filter.might_contain(&i.to_string()).await.unwrap());
        }
    }

    #[tokio::test]
    async fn false_positive_rate_is_near_target() {
        let (_, filter) = filter(10_000, 0.01);
        filter.add_batch((0..10_000).map(|i| i.to_string())).await.unwrap();

        let mut false_positives = 0_u32;
        for i in 1_000_000..1_010_000 {
            if filter.might_contain(&i.to_string()).await.unwrap() {
                false_positives += 1;
            }
        }

        // 1% of 10 000 is 100; allow generous slack for variance.
        assert!(false_positives < 200, "{false_positives} false positives");
    }

    #[test]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn production_sizing_holds_its_error_rate_at_capacity() {
        const CAPACITY: u64 = 10_000_000;
        const SAMPLE: u64 = 1_000_000;
        const TARGET: f64 = 0.0001;

        let params = BloomFilterParams::optimal(CAPACITY, TARGET).unwrap();
        let mut bitmap = vec![0_u64; params.bits.div_ceil(64) as usize];
        let set = |bitmap: &mut Vec<u64>, bit: u64| bitmap[(bit / 64) as usize] |= 1_u64 << (bit % 64);
        let get = |bitmap: &Vec<u64>, bit: u64| bitmap[(bit / 64) as usize] & (1_u64 << (bit % 64)) != 0;

        for id in 0..CAPACITY {
            for bit in params.positions(id.to_string().as_bytes()) {
                set(&mut bitmap, bit);
            }
        }

        for id in 0..CAPACITY {
            let found = params
                .positions(id.to_string().as_bytes())
                .into_iter()
                .all(|bit| get(&bitmap, bit));
            assert!(found, "inserted id {id} reported absent");
        }

        let false_positives = (CAPACITY..CAPACITY + SAMPLE)
            .filter(|id| {
                params
                    .positions(id.to_string().as_bytes())
                    .into_iter()
                    .all(|bit| get(&bitmap, bit))
            })
            .count();

        // About 100 expected; the bound sits ten standard deviations above that.
        let rate = false_positives as f64 / SAMPLE as f64;
        assert!(
            rate < 2.0 * TARGET,
            "{false_positives} false positives in {SAMPLE} lookups ({rate})"
        );
    }

    #[test]
    fn positions_spread_when_stride_is_a_multiple_of_the_bitmap() {
        for bits in [2_u64, 4, 64, 1024] {
            let params = BloomFilterParams { bits, hashes: 3 };
            for id in 0..2_000 {
                let positions: BTreeSet<u64> =
                    params.positions(id.to_string().as_bytes()).into_iter().collect();
                assert!(
                    positions.len() >= 2,
                    "id {id} hashed to a single bit of {bits}"
                );
            }
        }
    }

    #[tokio::test]
    async fn batch_writes_each_bit_once() {
        let (store, filter) = filter(1_000, 0.01);
        let commands_before = store.command_count();

        filter.add_batch(["7", "7", "7"]).await.unwrap();

        assert_eq!(store.command_count() - commands_before, 1);
        assert!(store.bit_count(SHOP_FILTER_KEY) <= filter.params().hashes as usize);
    }

    #[tokio::test]
    async fn clear_resets_membership() {
        let (_, filter) = filter(1_000, 0.01);
        filter.add("42").await.unwrap();

        filter.clear().await.unwrap();

        assert!(!filter.might_contain("42").await.unwrap());
    }

    proptest! {
        #[test]
        fn positions_are_in_range_and_deterministic(
            element in ".{0,32}",
            n in 1_u64..1_000_000,
        ) {
            let params = BloomFilterParams::optimal(n, 0.001).unwrap();
            let positions = params.positions(element.as_bytes());

            prop_assert_eq!(positions.len(), params.hashes as usize);
            prop_assert!(positions.iter().all(|p| *p < params.bits));
            prop_assert_eq!(positions, params.positions(element.as_bytes()));
        }
    }
}
