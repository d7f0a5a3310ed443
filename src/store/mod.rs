//! Shared key-value store capability
//!
//! Every piece of cross-instance state (locks, proxy leases, proxy health,
//! the instance registry, task schedules and the work queue) lives behind
//! [`SharedStore`]. All mutations that need exclusivity go through atomic
//! conditional operations, so no instance ever assumes ownership without
//! first winning one.
//!
//! Two backends are provided:
//!
//! - [`redis::RedisStore`] - production backend on a `deadpool-redis` pool
//! - [`memory::MemoryStore`] - in-process backend for tests and single-node runs
//!
//! # Example
//!
//! ```rust,ignore
//! use offerflow::store::RedisStore;
//!
//! let store = RedisStore::connect("redis://localhost:6379", 16).await?;
//! let won = store.set_if_absent("lock:a8db", "instance-1", ttl).await?;
//! ```

pub mod memory;
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::utils::error::StoreError;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle to a store backend
pub type SharedStoreRef = Arc<dyn SharedStore>;

/// Capability surface the pipeline needs from the shared store
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check that the store is reachable
    async fn ping(&self) -> StoreResult<()>;

    /// Read a string key
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically set `key` only if absent, with a TTL; true when set
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` only if it currently holds `expected`; true when deleted
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Reset the TTL of `key` only if it currently holds `expected`
    async fn expire_if_equals(&self, key: &str, expected: &str, ttl: Duration)
        -> StoreResult<bool>;

    /// Remaining TTL of a key, `None` when missing or persistent
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Read a hash field
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    /// Read a whole hash
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Delete a hash field; true when it existed
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Atomically add `delta` to an integer hash field, returning the new value
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Atomically increment an integer key, returning the new value
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Add or update a sorted-set member
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Remove a sorted-set member; true when it existed
    ///
    /// Exactly one of several concurrent callers observes `true`, which makes
    /// this usable as a claim operation.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Pop the member with the lowest score (ties: lowest member)
    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    /// Like [`SharedStore::zpopmin`] but waits up to `timeout` for a member
    async fn bzpopmin(&self, key: &str, timeout: Duration)
        -> StoreResult<Option<(String, f64)>>;

    /// Members with score `<= max`, lowest first, at most `limit`
    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Number of members in a sorted set
    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Fire-and-forget publish on a pub/sub channel
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
}

/// Store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis server (shared by all instances)
    Redis,
    /// In-process memory (single instance only)
    Memory,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Which backend to use
    pub backend: StoreBackend,

    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            key_prefix: "offerflow".to_string(),
        }
    }
}

/// Key naming for everything the pipeline keeps in the store
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("offerflow")
    }
}

impl Keyspace {
    /// Create a keyspace under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Lock key for a task
    pub fn task_lock(&self, task_key: &str) -> String {
        format!("{}:lock:task:{task_key}", self.prefix)
    }

    /// Lock key guarding scheduler ticks
    pub fn scheduler_lock(&self) -> String {
        format!("{}:lock:scheduler", self.prefix)
    }

    /// Lease key for a proxy
    pub fn proxy_lease(&self, proxy_id: &str) -> String {
        format!("{}:proxy:lease:{proxy_id}", self.prefix)
    }

    /// Hash of proxy id to proxy URI
    pub fn proxies(&self) -> String {
        format!("{}:proxy:list", self.prefix)
    }

    /// Hash of proxy id to consecutive failure count
    pub fn proxy_failures(&self) -> String {
        format!("{}:proxy:failures", self.prefix)
    }

    /// Hash of proxy id to last health observation
    pub fn proxy_health(&self) -> String {
        format!("{}:proxy:health", self.prefix)
    }

    /// Hash of instance id to instance record
    pub fn instances(&self) -> String {
        format!("{}:instances", self.prefix)
    }

    /// Hash of instance id to lifecycle status
    ///
    /// Kept apart from the record so heartbeats never overwrite a status change.
    pub fn instance_status(&self) -> String {
        format!("{}:instances:status", self.prefix)
    }

    /// Pub/sub channel carrying heartbeats
    pub fn heartbeat_channel(&self) -> String {
        format!("{}:heartbeats", self.prefix)
    }

    /// Hash of task key to task schedule
    pub fn tasks(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    /// Hash of task key to next due time (RFC 3339)
    pub fn task_runs(&self) -> String {
        format!("{}:tasks:next_run", self.prefix)
    }

    /// Sorted set of ready work items
    pub fn ready_queue(&self) -> String {
        format!("{}:queue:ready", self.prefix)
    }

    /// Sorted set of work items waiting for their retry time
    pub fn delayed_queue(&self) -> String {
        format!("{}:queue:delayed", self.prefix)
    }

    /// Sorted set of claimed work items keyed by visibility deadline
    pub fn inflight_queue(&self) -> String {
        format!("{}:queue:inflight", self.prefix)
    }

    /// Counter providing FIFO order among equal priorities
    pub fn queue_sequence(&self) -> String {
        format!("{}:queue:seq", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyspace_prefixing() {
        let keys = Keyspace::new("test");
        assert_eq!(keys.task_lock("a8db"), "test:lock:task:a8db");
        assert_eq!(keys.proxy_lease("1.2.3.4:80"), "test:proxy:lease:1.2.3.4:80");
        assert_eq!(keys.ready_queue(), "test:queue:ready");
    }

    #[test]
    fn test_store_config_from_toml() {
        let config: StoreConfig = toml::from_str("backend = \"memory\"").unwrap();
        assert_eq!(config.backend, StoreBackend::Memory);
        assert_eq!(config.key_prefix, "offerflow");
    }
}
