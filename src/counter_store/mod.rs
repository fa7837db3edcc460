//! Counter store
//!
//! Atomic counters with expiry, used by the rate limiters. Two backends:
//!
//! - **Redis**: shared across gateway replicas
//! - **Memory**: in-process fallback when no Redis is configured or reachable
//!
//! Every operation is atomic with respect to concurrent callers. Errors are
//! reported, never panicked on; callers decide how to degrade.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Key/value counter store with atomic increment and expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment a counter, creating it at 1 when absent or expired
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Increment a counter and make sure it expires within `window_secs`.
    ///
    /// A counter found without an expiry gets one, so a lost expiry from an
    /// earlier call heals on the next increment.
    async fn increment_in_window(&self, key: &str, window_secs: u64) -> Result<i64> {
        let count = self.increment(key).await?;
        if self.ttl(key).await?.is_none() {
            self.set_expiry(key, window_secs).await?;
        }
        Ok(count)
    }

    /// Decrement a counter, never below zero. Absent keys stay absent.
    async fn decrement(&self, key: &str) -> Result<i64>;

    /// Current value of a counter
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set the time-to-live of an existing counter
    async fn set_expiry(&self, key: &str, ttl_secs: u64) -> Result<()>;

    /// Remaining time-to-live in seconds, if the key exists and has one
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    /// Remove a counter
    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether a live counter exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Backend name for logs and status endpoints
    fn backend_name(&self) -> &'static str;
}

/// Counter store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterStoreConfig {
    /// Redis connection URL; the in-process store is used when absent
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix applied to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "gateway:".to_string()
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Build the configured counter store, falling back to memory when Redis is unavailable
pub async fn connect(config: &CounterStoreConfig) -> Arc<dyn CounterStore> {
    let Some(url) = &config.redis_url else {
        info!("No Redis configured, using in-process counter store");
        return Arc::new(MemoryCounterStore::new());
    };

    match RedisCounterStore::connect(url).await {
        Ok(store) => {
            info!("Redis connection successful, using Redis counter store");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                error = %e,
                "Redis unavailable, falling back to in-process counter store"
            );
            Arc::new(MemoryCounterStore::new())
        }
    }
}
