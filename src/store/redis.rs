// Redis-backed fast store
//
// Uses a ConnectionManager for automatic reconnection and multiplexing.
// Every operation is wrapped in a short timeout; callers treat both
// timeouts and transport errors as recoverable (fail open / miss).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use super::{FastStore, StoreError};

pub struct RedisStore {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis and build the shared connection manager
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            manager,
            op_timeout,
        })
    }

    /// Run a redis future under the per-operation timeout
    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StoreError::Unavailable(e.to_string())),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

#[async_trait]
impl FastStore for RedisStore {
    async fn incr_fixed(&self, key: &str, amount: i64, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let count: i64 = self.timed(conn.incr(key, amount)).await?;

        // First increment in this window creates the key; give it the
        // window's lifetime. Subsequent increments leave the expiry alone.
        if count == amount {
            let _: bool = self.timed(conn.expire(key, ttl.as_secs() as i64)).await?;
        }

        Ok(count)
    }

    async fn incr_rolling(
        &self,
        key: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let count: i64 = self.timed(conn.incr(key, amount)).await?;
        let _: bool = self.timed(conn.expire(key, ttl.as_secs() as i64)).await?;
        Ok(count)
    }

    async fn get_counter(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.manager.clone();
        self.timed(conn.get(key)).await
    }

    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.manager.clone();
        self.timed(conn.get(key)).await
    }

    async fn set_bytes(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = self
            .timed(conn.set_ex(key, value, ttl.as_secs()))
            .await?;
        Ok(())
    }

    async fn push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = self.timed(conn.lpush(key, value)).await?;
        let _: () = self
            .timed(conn.ltrim(key, 0, max_len as isize - 1))
            .await?;
        Ok(())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        self.timed(conn.lrange(key, start, stop)).await
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.manager.clone();
        self.timed(conn.llen(key)).await
    }

    async fn hash_incr(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = self.timed(conn.hincr(key, field, amount)).await?;
        let _: bool = self.timed(conn.expire(key, ttl.as_secs() as i64)).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.manager.clone();
        self.timed(conn.hgetall(key)).await
    }
}
