use super::CounterStore;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::time::Duration;
use tracing::debug;

/// Upper bound on establishing the initial connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Decrement that never goes below zero and never creates the key
const DECREMENT_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return 0
end
if tonumber(current) <= 0 then
    return 0
end
return redis.call('DECR', KEYS[1])
"#;

/// Increment and attach the window expiry in one step.
///
/// KEYS[1] = counter key, ARGV[1] = window in seconds
const INCREMENT_IN_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return count
"#;

/// Redis-backed counter store
#[derive(Clone)]
pub struct RedisCounterStore {
    /// Connection manager; clones share one multiplexed connection
    connection: ConnectionManager,
}

impl RedisCounterStore {
    /// Connect and verify the server answers PING
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;

        let connection = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| GatewayError::CounterStore("Redis connection timed out".to_string()))??;

        let mut store = Self { connection };
        store.ping().await?;
        Ok(store)
    }

    /// Test Redis connection
    pub async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.connection).await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, 1).await?;
        debug!(key, value, "Incremented counter");
        Ok(value)
    }

    async fn increment_in_window(&self, key: &str, window_secs: u64) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = Script::new(INCREMENT_IN_WINDOW_SCRIPT)
            .key(key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;
        debug!(key, value, window_secs, "Incremented windowed counter");
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = Script::new(DECREMENT_SCRIPT)
            .key(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        let value: Option<i64> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection.clone();
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        let _: bool = conn.expire(key, ttl).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.connection.clone();
        // -2: missing key, -1: no expiry
        let ttl: i64 = conn.ttl(key).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
