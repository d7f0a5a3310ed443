//! Store wrapper for unit tests that need slow or failing backends

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{MemoryStore, SharedStore, StoreResult};
use crate::utils::error::StoreError;

/// [`MemoryStore`] with random latency on hash access and injectable `zadd` failures
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    max_hash_latency: Duration,
    fail_zadd: AtomicU32,
}

impl FaultyStore {
    /// Sleep up to `max` around every hash read and write
    pub fn with_hash_latency(max: Duration) -> Self {
        Self {
            max_hash_latency: max,
            ..Self::default()
        }
    }

    /// Make the next `n` calls to `zadd` fail
    pub fn fail_next_zadd(&self, n: u32) {
        self.fail_zadd.store(n, Ordering::SeqCst);
    }

    async fn lag(&self) {
        if self.max_hash_latency.is_zero() {
            return;
        }
        let max = self.max_hash_latency.as_millis() as u64;
        let millis = rand::thread_rng().gen_range(0..=max);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

#[async_trait]
impl SharedStore for FaultyStore {
    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.inner.expire_if_equals(key, expected, ttl).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.inner.ttl(key).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.lag().await;
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let value = self.inner.hget(key, field).await;
        self.lag().await;
        value
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hdel(key, field).await
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.inner.hincr(key, field, delta).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.inner.incr(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let injected = self
            .fail_zadd
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Connection("injected zadd failure".to_string()));
        }
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.inner.zrem(key, member).await
    }

    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        self.inner.zpopmin(key).await
    }

    async fn bzpopmin(&self, key: &str, timeout: Duration) -> StoreResult<Option<(String, f64)>> {
        self.inner.bzpopmin(key, timeout).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.inner.zrange_by_score(key, max, limit).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.inner.zcard(key).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.inner.publish(channel, message).await
    }
}
