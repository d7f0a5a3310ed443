//! Distributed locks on top of the shared store
//!
//! A lock is a key holding an owner token with a TTL. Acquire is an atomic
//! set-if-absent; release and renew only act while the stored token still
//! matches, so a holder whose lock expired and was re-taken can never touch
//! the new owner's lock.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;
use crate::store::{SharedStoreRef, StoreResult};
use crate::utils::retry::{poll_with_backoff, RetryPolicy};

/// Proof of lock ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    /// Store key the lock lives under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner token written into the key
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Acquires and tracks locks for one instance
pub struct LockManager {
    store: SharedStoreRef,
    instance_id: String,
    /// Locks believed held, key to token
    held: Mutex<HashMap<String, String>>,
}

impl LockManager {
    /// Create a manager issuing tokens for `instance_id`
    pub fn new(store: SharedStoreRef, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Try once to take `key` for `ttl`
    ///
    /// `None` means another owner holds it; that is contention, not an error.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockToken>> {
        let token = format!("{}/{}", self.instance_id, Uuid::new_v4().simple());

        if !self.store.set_if_absent(key, &token, ttl).await? {
            debug!(lock = %key, "Lock held by another owner");
            metrics::record_lock_contention();
            return Ok(None);
        }

        self.held
            .lock()
            .await
            .insert(key.to_string(), token.clone());
        debug!(lock = %key, ttl_secs = ttl.as_secs(), "Lock acquired");

        Ok(Some(LockToken {
            key: key.to_string(),
            token,
        }))
    }

    /// Keep trying to take `key` under the backoff policy
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        policy: &RetryPolicy,
    ) -> StoreResult<Option<LockToken>> {
        poll_with_backoff(policy, || async move {
            match self.acquire(key, ttl).await {
                Ok(Some(token)) => Some(Ok(token)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        })
        .await
        .transpose()
    }

    /// Release a lock; false when it was no longer ours
    pub async fn release(&self, lock: &LockToken) -> StoreResult<bool> {
        self.forget(lock).await;
        let released = self.store.delete_if_equals(&lock.key, &lock.token).await?;
        if released {
            debug!(lock = %lock.key, "Lock released");
        } else {
            debug!(lock = %lock.key, "Lock already expired or re-taken");
        }
        Ok(released)
    }

    /// Extend a held lock; false means ownership was lost
    pub async fn renew(&self, lock: &LockToken, ttl: Duration) -> StoreResult<bool> {
        let renewed = self
            .store
            .expire_if_equals(&lock.key, &lock.token, ttl)
            .await?;
        if !renewed {
            warn!(lock = %lock.key, "Lock lost before renewal");
            self.forget(lock).await;
        }
        Ok(renewed)
    }

    /// Release every lock this manager still believes it holds
    ///
    /// Returns the number actually released.
    pub async fn release_all(&self) -> usize {
        let held: Vec<(String, String)> = self.held.lock().await.drain().collect();
        let mut released = 0;

        for (key, token) in held {
            match self.store.delete_if_equals(&key, &token).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(lock = %key, error = %e, "Failed to release lock"),
            }
        }

        released
    }

    /// Number of locks currently tracked as held
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    async fn forget(&self, lock: &LockToken) {
        let mut held = self.held.lock().await;
        if held.get(&lock.key) == Some(&lock.token) {
            held.remove(&lock.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn manager(store: &SharedStoreRef, id: &str) -> LockManager {
        LockManager::new(Arc::clone(store), id)
    }

    #[tokio::test]
    async fn test_lock_exclusive() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");
        let ttl = Duration::from_secs(30);

        let token = a.acquire("lock:k", ttl).await.unwrap().unwrap();
        assert!(b.acquire("lock:k", ttl).await.unwrap().is_none());

        assert!(a.release(&token).await.unwrap());
        assert!(b.acquire("lock:k", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let managers: Vec<Arc<LockManager>> = (0..8)
            .map(|i| Arc::new(manager(&store, &format!("i{i}"))))
            .collect();

        let mut handles = Vec::new();
        for m in &managers {
            let m = Arc::clone(m);
            handles.push(tokio::spawn(async move {
                m.acquire("lock:race", Duration::from_secs(30)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_cannot_release_new_owner() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        let old = a.acquire("lock:k", Duration::from_secs(5)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let fresh = b.acquire("lock:k", Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(!a.release(&old).await.unwrap());
        assert!(!a.renew(&old, Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.get("lock:k").await.unwrap().as_deref(), Some(fresh.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_lock() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        let token = a.acquire("lock:k", Duration::from_secs(5)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(a.renew(&token, Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(4)).await;

        assert!(b.acquire("lock:k", Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_retry_waits_for_expiry() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let b = manager(&store, "b");

        let _held = a.acquire("lock:k", Duration::from_millis(150)).await.unwrap();
        let policy = RetryPolicy::with_delays(5, 100, 100).without_jitter();

        let token = b
            .acquire_with_retry("lock:k", Duration::from_secs(5), &policy)
            .await
            .unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_release_all() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = manager(&store, "a");
        let ttl = Duration::from_secs(30);

        a.acquire("lock:1", ttl).await.unwrap();
        a.acquire("lock:2", ttl).await.unwrap();
        assert_eq!(a.held_count().await, 2);

        assert_eq!(a.release_all().await, 2);
        assert_eq!(a.held_count().await, 0);
        assert!(store.get("lock:1").await.unwrap().is_none());
    }
}
