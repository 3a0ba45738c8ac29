//! # Flash Sale Redis
//!
//! `Redis` implementation of [`KeyValueStore`].
//!
//! # Atomicity
//!
//! - Lock acquisition is a single `SET key token NX PX ttl`
//! - Lock release, admission and revocation are Lua scripts, so each runs as
//!   one indivisible unit on the server
//! - Bitmap reads and writes are pipelined `GETBIT`/`SETBIT` batches
//!
//! # Example
//!
//! ```no_run
//! use flash_sale_redis::RedisKeyValueStore;
//! use flash_sale_core::kv::KeyValueStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisKeyValueStore::new("redis://127.0.0.1:6379").await?;
//! store.set("seckill:stock:1", "100").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use flash_sale_core::kv::{KeyValueStore, StoreError};
use flash_sale_core::types::AdmissionOutcome;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::time::Duration;

const ADMISSION_LUA: &str = include_str!("lua/admission.lua");
const REVOKE_LUA: &str = include_str!("lua/revoke.lua");
const UNLOCK_LUA: &str = include_str!("lua/unlock.lua");

/// `Redis`-backed key-value store.
///
/// Cloning is cheap: clones share the same multiplexed connection.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    admission: Script,
    revoke: Script,
    unlock: Script,
}

impl RedisKeyValueStore {
    /// Connect to `Redis`.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the connection fails.
    pub async fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!("Connected to Redis");

        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            admission: Script::new(ADMISSION_LUA),
            revoke: Script::new(REVOKE_LUA),
            unlock: Script::new(UNLOCK_LUA),
        }
    }
}

/// Map a `Redis` error, separating connectivity from rejected commands.
fn store_error(context: &str, e: &RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        StoreError::Unavailable(format!("{context}: {e}"))
    } else {
        StoreError::CommandFailed(format!("{context}: {e}"))
    }
}

/// Decode the reply of the admission script.
fn decode_admission(code: i64) -> Result<AdmissionOutcome, StoreError> {
    AdmissionOutcome::from_code(code).ok_or_else(|| {
        StoreError::UnexpectedReply(format!("admission script returned {code}"))
    })
}

#[allow(clippy::cast_possible_truncation)] // TTLs are seconds to minutes
fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

impl KeyValueStore for RedisKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to SET NX", &e))?;

        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();

        let deleted: i64 = self
            .unlock
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to execute compare-and-delete", &e))?;

        Ok(deleted > 0)
    }

    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn_manager.clone();

        let value: i64 = conn
            .incr(key, 1_i64)
            .await
            .map_err(|e| store_error("Failed to INCR", &e))?;

        u64::try_from(value)
            .map_err(|_| StoreError::UnexpectedReply(format!("counter '{key}' is negative: {value}")))
    }

    async fn run_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut conn = self.conn_manager.clone();

        let code: i64 = self
            .admission
            .key(stock_key)
            .key(buyers_key)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to execute admission script", &e))?;

        decode_admission(code)
    }

    async fn revoke_admission(
        &self,
        stock_key: &str,
        buyers_key: &str,
        member: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();

        let revoked: i64 = self
            .revoke
            .key(stock_key)
            .key(buyers_key)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to execute revoke script", &e))?;

        Ok(revoked == 1)
    }

    async fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<(), StoreError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn_manager.clone();

        let mut pipe = redis::pipe();
        for offset in offsets {
            pipe.cmd("SETBIT").arg(key).arg(*offset).arg(1).ignore();
        }
        let (): () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to pipeline SETBIT", &e))?;

        Ok(())
    }

    async fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, StoreError> {
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn_manager.clone();

        let mut pipe = redis::pipe();
        for offset in offsets {
            pipe.cmd("GETBIT").arg(key).arg(*offset);
        }
        let bits: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to pipeline GETBIT", &e))?;

        Ok(bits.into_iter().map(|bit| bit != 0).collect())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.get(key)
            .await
            .map_err(|e| store_error("Failed to GET", &e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.set(key, value)
            .await
            .map_err(|e| store_error("Failed to SET", &e))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn_manager.clone();
        let (): () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error("Failed to SET PX", &e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| store_error("Failed to DEL", &e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        conn.exists(key)
            .await
            .map_err(|e| store_error("Failed to EXISTS", &e))
    }
}
