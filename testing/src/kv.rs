//! In-memory key-value store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::types::AdmissionOutcome;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Data {
    strings: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, HashSet<String>>,
    bitmaps: HashMap<String, HashSet<u64>>,
}

impl Data {
    fn live_string(&mut self, key: &str) -> Option<&String> {
        let expired = matches!(
            self.strings.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|(value, _)| value)
    }

    fn contains(&mut self, key: &str) -> bool {
        self.live_string(key).is_some() || self.sets.contains_key(key) || self.bitmaps.contains_key(key)
    }
}

/// In-memory [`KeyValueStore`] for fast, deterministic tests.
///
/// Every operation takes one mutex, which makes each of them atomic the way a
/// single-threaded store executes commands and scripts. Expiry uses
/// `tokio::time::Instant`, so tests running with a paused clock can advance past
/// a TTL without sleeping.
///
/// # Example
///
/// ```
/// use flash_sale_testing::InMemoryKeyValueStore;
/// use flash_sale_core::kv::KeyValueStore;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let kv = InMemoryKeyValueStore::new();
/// assert!(kv.set_if_absent("lock:a", "t1", Duration::from_secs(5)).await?);
/// assert!(!kv.set_if_absent("lock:a", "t2", Duration::from_secs(5)).await?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<Mutex<Data>>,
    unavailable: Arc<AtomicBool>,
    commands: Arc<AtomicUsize>,
}

impl InMemoryKeyValueStore {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent command fail with [`StoreError::Unavailable`]
    /// until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of commands executed so far (including failed ones)
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    /// Members of the set at `key`
    #[must_use]
    pub fn set_members(&self, key: &str) -> HashSet<String> {
        self.data
            .lock()
            .unwrap()
            .sets
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of bits set in the bitmap at `key`
    #[must_use]
    pub fn bit_count(&self, key: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .bitmaps
            .get(key)
            .map_or(0, HashSet::len)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("in-memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::CommandFailed(format!("value at '{key}' is not an integer")))
}

impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        if data.live_string(key).is_some() {
            return Ok(false);
        }
        data.strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        if data.live_string(key).map(String::as_str) == Some(expected) {
            data.strings.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        let current = match data.live_string(key) {
            Some(raw) => parse_int(key, raw)?,
            None => 0,
        };
        let next = current + 1;
        let expiry = data.strings.get(key).and_then(|(_, deadline)| *deadline);
        data.strings.insert(key.to_string(), (next.to_string(), expiry));
        u64::try_from(next).map_err(|_| StoreError::CommandFailed(format!("counter '{key}' is negative")))
    }

    async fn run_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> Result<AdmissionOutcome, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        let stock = match data.live_string(stock_key) {
            Some(raw) => parse_int(stock_key, raw)?,
            None => return Ok(AdmissionOutcome::StockExhausted),
        };
        if stock <= 0 {
            return Ok(AdmissionOutcome::StockExhausted);
        }
        if data
            .sets
            .get(buyers_key)
            .is_some_and(|buyers| buyers.contains(member))
        {
            return Ok(AdmissionOutcome::DuplicateUser);
        }
        data.strings
            .insert(stock_key.to_string(), ((stock - 1).to_string(), None));
        data.sets
            .entry(buyers_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(AdmissionOutcome::Admitted)
    }

    async fn revoke_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        let removed = data
            .sets
            .get_mut(buyers_key)
            .is_some_and(|buyers| buyers.remove(member));
        if !removed {
            return Ok(false);
        }
        let stock = match data.live_string(stock_key) {
            Some(raw) => parse_int(stock_key, raw)?,
            None => 0,
        };
        data.strings
            .insert(stock_key.to_string(), ((stock + 1).to_string(), None));
        Ok(true)
    }

    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<(), StoreError> {
        self.check()?;
        self.data
            .lock()
            .unwrap()
            .bitmaps
            .entry(key.to_string())
            .or_default()
            .extend(offsets.iter().copied());
        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, StoreError> {
        self.check()?;
        let data = self.data.lock().unwrap();
        let bits = data.bitmaps.get(key);
        Ok(offsets
            .iter()
            .map(|offset| bits.is_some_and(|set| set.contains(offset)))
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        Ok(self.data.lock().unwrap().live_string(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.data
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check()?;
        self.data
            .lock()
            .unwrap()
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock().unwrap();
        let existed = data.contains(key);
        data.strings.remove(key);
        data.sets.remove(key);
        data.bitmaps.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.data.lock().unwrap().contains(key))
    }
}
