//! Fast store abstraction
//!
//! All cross-request coordination (admission counters, response cache,
//! rolling metrics, durable log) goes through the `FastStore` trait. The
//! gateway holds no locks of its own; every mutation is an atomic
//! single-key operation so no invariant ever spans two keys.
//!
//! Two implementations:
//! - `RedisStore`: shared across gateway instances (production)
//! - `MemoryStore`: in-process, for tests and single-node deployments

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Store operation failure
///
/// Callers decide the degradation policy: admission fails open, cache
/// reads count as a miss, observability writes are logged and dropped.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend unreachable or returned a protocol error
    Unavailable(String),
    /// Operation exceeded the configured per-op timeout
    Timeout,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Timeout => write!(f, "Store operation timed out"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Atomic key/value operations backing the gateway's shared state
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Increment a fixed-window counter by `amount`, setting the window
    /// expiry only when this increment created the key (counter == amount).
    /// Returns the counter value after the increment.
    async fn incr_fixed(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Increment a rolling counter by `amount`, refreshing the expiry on
    /// every increment. Returns the counter value after the increment.
    async fn incr_rolling(&self, key: &str, amount: i64, ttl: Duration)
        -> Result<i64, StoreError>;

    /// Read a counter value, `None` if absent or expired
    async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// Read a raw value, `None` if absent or expired
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a raw value with an expiry
    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    /// Push a value to the head of a list and trim the list to `max_len`
    async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;

    /// Read a slice of a list; `stop` is inclusive, negative indexes count
    /// from the tail (Redis LRANGE semantics)
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Current list length
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Increment a hash field, refreshing the hash expiry
    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Read all fields of a hash; empty map if absent or expired
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
}
