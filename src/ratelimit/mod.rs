//! Token-bucket rate limiting with concurrency caps
//!
//! Each scope (global, or one proxy) owns a `governor` token bucket and a
//! fair semaphore bounding concurrent requests. Waiters are served in FIFO
//! order: the semaphore queues fairly, and a fair mutex serializes the token
//! wait so a later caller cannot overtake an earlier one.
//!
//! A proxy request waits for its proxy's slot before touching the global
//! scope, so callers queued behind a busy proxy hold no global slot.
//!
//! Limits are per instance. Upstream 429 responses are handled by backoff in
//! the fetcher.

use governor::{DefaultDirectRateLimiter, Quota};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// What a permit is charged against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Instance-wide budget
    Global,
    /// One proxy's budget, nested inside the global one
    Proxy(String),
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Global sustained request rate
    pub requests_per_second: u32,

    /// Global burst size
    pub burst: u32,

    /// Global cap on concurrent requests
    pub max_concurrent: usize,

    /// Per-proxy sustained request rate
    pub per_proxy_requests_per_second: u32,

    /// Per-proxy burst size
    pub per_proxy_burst: u32,

    /// Per-proxy cap on concurrent requests
    pub per_proxy_max_concurrent: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            burst: 10,
            max_concurrent: 32,
            per_proxy_requests_per_second: 2,
            per_proxy_burst: 2,
            per_proxy_max_concurrent: 2,
        }
    }
}

/// Returned when the limiter was closed while waiting
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("rate limiter closed")]
pub struct LimiterClosed;

/// One token bucket plus concurrency slots
struct Bucket {
    limiter: DefaultDirectRateLimiter,
    slots: Arc<Semaphore>,
    order: Mutex<()>,
}

impl Bucket {
    fn new(rate: u32, burst: u32, concurrent: usize) -> Self {
        let rate = NonZeroU32::new(rate).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        Self {
            limiter: DefaultDirectRateLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            slots: Arc::new(Semaphore::new(concurrent.max(1))),
            order: Mutex::new(()),
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, LimiterClosed> {
        let slot = self.slot().await?;
        self.pace().await;
        Ok(slot)
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit, LimiterClosed> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)
    }

    /// Wait for a token, in arrival order
    async fn pace(&self) {
        let _turn = self.order.lock().await;
        self.limiter.until_ready().await;
    }
}

/// Held while a request is in flight; releases all slots on drop
#[derive(Debug)]
pub struct ScopedPermit {
    scope: Scope,
    _global: OwnedSemaphorePermit,
    _proxy: Option<OwnedSemaphorePermit>,
}

impl ScopedPermit {
    /// Scope the permit was acquired for
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

/// Instance-local request admission
pub struct RateLimiter {
    config: RateLimitConfig,
    global: Bucket,
    proxies: Mutex<HashMap<String, Arc<Bucket>>>,
}

impl RateLimiter {
    /// Create a limiter from configuration
    pub fn new(config: RateLimitConfig) -> Self {
        let global = Bucket::new(config.requests_per_second, config.burst, config.max_concurrent);
        Self {
            config,
            global,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a permit in `scope`
    pub async fn acquire(&self, scope: Scope) -> Result<ScopedPermit, LimiterClosed> {
        match scope {
            Scope::Global => Ok(ScopedPermit {
                _global: self.global.acquire().await?,
                _proxy: None,
                scope: Scope::Global,
            }),
            Scope::Proxy(id) => self.acquire_for_proxy(&id).await,
        }
    }

    /// Take the proxy's slot, then the global budget, then the proxy's token
    pub async fn acquire_for_proxy(&self, proxy_id: &str) -> Result<ScopedPermit, LimiterClosed> {
        let bucket = self.bucket(proxy_id).await;
        let proxy = bucket.slot().await?;
        let global = self.global.acquire().await?;
        bucket.pace().await;

        Ok(ScopedPermit {
            scope: Scope::Proxy(proxy_id.to_string()),
            _global: global,
            _proxy: Some(proxy),
        })
    }

    /// Wake all waiters with [`LimiterClosed`] and refuse new permits
    pub async fn close(&self) {
        self.global.slots.close();
        for bucket in self.proxies.lock().await.values() {
            bucket.slots.close();
        }
    }

    /// Free global concurrency slots
    pub fn available_global(&self) -> usize {
        self.global.slots.available_permits()
    }

    async fn bucket(&self, proxy_id: &str) -> Arc<Bucket> {
        let mut proxies = self.proxies.lock().await;
        let bucket = proxies.entry(proxy_id.to_string()).or_insert_with(|| {
            Arc::new(Bucket::new(
                self.config.per_proxy_requests_per_second,
                self.config.per_proxy_burst,
                self.config.per_proxy_max_concurrent,
            ))
        });
        Arc::clone(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn fast(concurrent: usize, per_proxy: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000,
            burst: 1000,
            max_concurrent: concurrent,
            per_proxy_requests_per_second: 1000,
            per_proxy_burst: 1000,
            per_proxy_max_concurrent: per_proxy,
        })
    }

    #[tokio::test]
    async fn test_token_bucket_paces_requests() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_second: 10,
            burst: 1,
            ..Default::default()
        });

        let started = Instant::now();
        for _ in 0..5 {
            drop(limiter.acquire(Scope::Global).await.unwrap());
        }
        // First token is immediate, the next four are 100ms apart
        assert!(started.elapsed() >= Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_release_on_drop() {
        let limiter = fast(2, 10);
        let a = limiter.acquire(Scope::Global).await.unwrap();
        let _b = limiter.acquire(Scope::Global).await.unwrap();
        assert_eq!(limiter.available_global(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(Scope::Global)).await;
        assert!(blocked.is_err());

        drop(a);
        let third =
            tokio::time::timeout(Duration::from_millis(500), limiter.acquire(Scope::Global)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_proxy_permit_holds_global_slot() {
        let limiter = fast(4, 1);
        let permit = limiter
            .acquire(Scope::Proxy("http://p:1".to_string()))
            .await
            .unwrap();
        assert_eq!(permit.scope(), &Scope::Proxy("http://p:1".to_string()));
        assert_eq!(limiter.available_global(), 3);

        let same_proxy = tokio::time::timeout(
            Duration::from_millis(50),
            limiter.acquire_for_proxy("http://p:1"),
        )
        .await;
        assert!(same_proxy.is_err());

        let other = limiter.acquire_for_proxy("http://q:1").await.unwrap();
        drop(other);
        drop(permit);
        assert_eq!(limiter.available_global(), 4);
    }

    /// Spawn `count` waiters 10ms apart; each records its index when admitted
    async fn queue_waiters(
        limiter: &Arc<RateLimiter>,
        scope: Scope,
        count: usize,
    ) -> (Arc<Mutex<Vec<usize>>>, Vec<tokio::task::JoinHandle<()>>) {
        let admitted = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..count {
            let limiter = Arc::clone(limiter);
            let admitted = Arc::clone(&admitted);
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire(scope).await.unwrap();
                admitted.lock().await.push(n);
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (admitted, handles)
    }

    #[tokio::test]
    async fn test_slot_waiters_admitted_in_arrival_order() {
        let limiter = Arc::new(fast(1, 1));
        let held = limiter.acquire(Scope::Global).await.unwrap();

        let (admitted, handles) = queue_waiters(&limiter, Scope::Global, 6).await;
        assert!(admitted.lock().await.is_empty());
        drop(held);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*admitted.lock().await, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_token_waiters_admitted_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            requests_per_second: 1000,
            burst: 1000,
            max_concurrent: 16,
            per_proxy_requests_per_second: 20,
            per_proxy_burst: 1,
            per_proxy_max_concurrent: 16,
        }));
        drop(limiter.acquire_for_proxy("http://p:1").await.unwrap());

        let (admitted, handles) =
            queue_waiters(&limiter, Scope::Proxy("http://p:1".to_string()), 4).await;
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*admitted.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_saturated_proxy_leaves_global_room() {
        let limiter = Arc::new(fast(4, 1));
        let held = limiter.acquire_for_proxy("http://p:1").await.unwrap();

        // Three more callers queue behind the busy proxy
        let (admitted, handles) =
            queue_waiters(&limiter, Scope::Proxy("http://p:1".to_string()), 3).await;
        assert!(admitted.lock().await.is_empty());
        assert_eq!(limiter.available_global(), 3);

        let other = tokio::time::timeout(
            Duration::from_millis(200),
            limiter.acquire_for_proxy("http://q:1"),
        )
        .await;
        assert!(other.is_ok(), "another proxy was starved");
        drop(other);

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*admitted.lock().await, vec![0, 1, 2]);
        assert_eq!(limiter.available_global(), 4);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let limiter = Arc::new(fast(1, 1));
        let _held = limiter.acquire(Scope::Global).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(Scope::Global).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.close().await;

        assert_eq!(waiter.await.unwrap().unwrap_err(), LimiterClosed);
    }
}
