//! Redis store backend on a `deadpool-redis` connection pool
//!
//! Conditional delete and conditional expire run as Lua scripts so the
//! compare and the write happen in one server-side step.

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;

use super::{SharedStore, StoreResult};
use crate::utils::error::StoreError;

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

/// Redis-backed shared store
pub struct RedisStore {
    /// Connection pool
    pool: Pool,
    delete_if_equals: Script,
    expire_if_equals: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool.status())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Build a pool for `url` and verify the server answers
    pub async fn connect(url: &str, pool_size: usize) -> StoreResult<Self> {
        let pool = PoolConfig::from_url(url)
            .builder()
            .map_err(|e| StoreError::Connection(format!("Failed to create pool builder: {e}")))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Connection(format!("Failed to create Redis pool: {e}")))?;

        let store = Self {
            pool,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
        };
        store.ping().await?;

        tracing::info!(url = %redact_url(url), pool_size, "Connected to Redis");
        Ok(store)
    }

    /// Underlying pool, shared with the outbound stream transport
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

fn millis(duration: Duration) -> u64 {
    (duration.as_millis() as u64).max(1)
}

/// Strip credentials from a Redis URL before logging it
fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut *conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = self
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(millis(ttl))
            .invoke_async(&mut *conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut *conn).await?;
        // -2 missing, -1 no expiry
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut *conn).await?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(field)
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zpopmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut conn = self.conn().await?;
        let popped: Vec<(String, f64)> =
            redis::cmd("ZPOPMIN").arg(key).query_async(&mut *conn).await?;
        Ok(popped.into_iter().next())
    }

    async fn bzpopmin(
        &self,
        key: &str,
        timeout: Duration,
    ) -> StoreResult<Option<(String, f64)>> {
        // A zero timeout would block forever on the server
        if timeout.is_zero() {
            return self.zpopmin(key).await;
        }

        let mut conn = self.conn().await?;
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;
        Ok(popped.map(|(_, member, score)| (member, score)))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn().await?;
        let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut *conn)
            .await?;
        Ok(members)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("ZCARD").arg(key).query_async(&mut *conn).await?;
        Ok(count)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}
