// In-process fast store
//
// Mirrors the Redis semantics the gateway relies on (fixed-window INCR,
// expiry refresh, LPUSH/LTRIM, HINCRBY) over a single mutex-guarded map.
// Entries are evicted lazily when touched past their deadline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{FastStore, StoreError};

enum Value {
    Counter(i64),
    Bytes(Vec<u8>),
    List(VecDeque<String>),
    Hash(HashMap<String, i64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the entry if its deadline has passed, so the caller sees
    /// the same absent-key behavior Redis gives after expiry
    fn evict_if_expired(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
    }

    fn wrong_type() -> StoreError {
        StoreError::Unavailable("WRONGTYPE operation against existing key".to_string())
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn incr_fixed(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => {
                *count += amount;
                Ok(*count)
            }
            Some(_) => Err(Self::wrong_type()),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Counter(amount),
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(amount)
            }
        }
    }

    async fn incr_rolling(
        &self,
        key: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Counter(0),
            expires_at: None,
        });
        entry.expires_at = Some(now + ttl);

        match &mut entry.value {
            Value::Counter(count) => {
                *count += amount;
                Ok(*count)
            }
            _ => Err(Self::wrong_type()),
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        match entries.get(key) {
            Some(Entry {
                value: Value::Counter(count),
                ..
            }) => Ok(Some(*count)),
            Some(_) => Err(Self::wrong_type()),
            None => Ok(None),
        }
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        match entries.get(key) {
            Some(Entry {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(Self::wrong_type()),
            None => Ok(None),
        }
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value.to_string());
                list.truncate(max_len);
                Ok(())
            }
            _ => Err(Self::wrong_type()),
        }
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        let list = match entries.get(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => list,
            Some(_) => return Err(Self::wrong_type()),
            None => return Ok(Vec::new()),
        };

        let len = list.len() as isize;
        let resolve = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx
            }
        };

        let start = resolve(start);
        let stop = resolve(stop).min(len - 1);
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        match entries.get(key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len() as u64),
            Some(_) => Err(Self::wrong_type()),
            None => Ok(0),
        }
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        entry.expires_at = Some(now + ttl);

        match &mut entry.value {
            Value::Hash(fields) => {
                *fields.entry(field.to_string()).or_insert(0) += amount;
                Ok(())
            }
            _ => Err(Self::wrong_type()),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Self::evict_if_expired(&mut entries, key, now);

        match entries.get(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect()),
            Some(_) => Err(Self::wrong_type()),
            None => Ok(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_counter_increments_within_window() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_fixed("rate:a:1", 1, ttl).await.unwrap(), 1);
        assert_eq!(store.incr_fixed("rate:a:1", 1, ttl).await.unwrap(), 2);
        assert_eq!(store.incr_fixed("rate:a:1", 1, ttl).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fixed_counter_resets_after_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(10);

        assert_eq!(store.incr_fixed("rate:b:1", 1, ttl).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.incr_fixed("rate:b:1", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rolling_counter_refreshes_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(40);

        store.incr_rolling("m:total", 1, ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        // Second increment pushes the deadline out again
        assert_eq!(store.incr_rolling("m:total", 1, ttl).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get_counter("m:total").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_bytes_roundtrip_and_expiry() {
        let store = MemoryStore::new();

        store
            .set_bytes("cache:x", b"payload", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            store.get_bytes("cache:x").await.unwrap(),
            Some(b"payload".to_vec())
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get_bytes("cache:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_trim_bounds_list_newest_first() {
        let store = MemoryStore::new();

        for i in 0..5 {
            store
                .push_trim("logs", &format!("entry-{}", i), 3)
                .await
                .unwrap();
        }

        assert_eq!(store.list_len("logs").await.unwrap(), 3);
        let entries = store.list_range("logs", 0, -1).await.unwrap();
        assert_eq!(entries, vec!["entry-4", "entry-3", "entry-2"]);
    }

    #[tokio::test]
    async fn test_list_range_pagination() {
        let store = MemoryStore::new();
        for i in 0..10 {
            store
                .push_trim("logs", &format!("e{}", i), 100)
                .await
                .unwrap();
        }

        let page = store.list_range("logs", 2, 4).await.unwrap();
        assert_eq!(page, vec!["e7", "e6", "e5"]);

        let out_of_range = store.list_range("logs", 50, 60).await.unwrap();
        assert!(out_of_range.is_empty());
    }

    #[tokio::test]
    async fn test_hash_incr_accumulates_fields() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        store
            .hash_incr("stats:today", "total_requests", 1, ttl)
            .await
            .unwrap();
        store
            .hash_incr("stats:today", "total_requests", 1, ttl)
            .await
            .unwrap();
        store
            .hash_incr("stats:today", "total_bytes", 1024, ttl)
            .await
            .unwrap();

        let fields = store.hash_get_all("stats:today").await.unwrap();
        assert_eq!(fields.get("total_requests"), Some(&"2".to_string()));
        assert_eq!(fields.get("total_bytes"), Some(&"1024".to_string()));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let store = MemoryStore::new();
        store
            .set_bytes("k", b"v", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.incr_fixed("k", 1, Duration::from_secs(60)).await.is_err());
    }
}
