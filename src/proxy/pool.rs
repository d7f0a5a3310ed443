//! Shared proxy pool with leases and health bookkeeping
//!
//! The proxy list, failure counters and health observations live in shared
//! hashes. A lease is a key per proxy holding the leaseholder's token with a
//! TTL, so at most one instance uses a proxy at a time and a crashed holder's
//! lease simply expires.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::address::ProxyAddress;
use super::ProxyPoolConfig;
use crate::metrics;
use crate::store::{Keyspace, SharedStoreRef, StoreResult};
use crate::utils::chrono_duration;
use crate::utils::error::ProxyError;

/// Exclusive right to use one proxy until the TTL runs out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLease {
    proxy: ProxyAddress,
    token: String,
}

impl ProxyLease {
    /// The leased proxy
    pub fn proxy(&self) -> &ProxyAddress {
        &self.proxy
    }

    /// Identifier of the leased proxy
    pub fn proxy_id(&self) -> String {
        self.proxy.id()
    }

    /// Token written into the lease key
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Last health observation of a proxy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyHealth {
    pub last_checked: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
}

/// Point-in-time view of one proxy, for operators
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRecord {
    pub id: String,
    pub authenticated: bool,
    pub health: ProxyHealth,
    pub healthy: bool,
    pub lease_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

/// Proxy pool view for one instance
pub struct ProxyPool {
    store: SharedStoreRef,
    keys: Keyspace,
    instance_id: String,
    config: ProxyPoolConfig,
    /// Leases this instance holds, by proxy id
    held: Mutex<HashMap<String, ProxyLease>>,
}

impl ProxyPool {
    /// Create a pool view for `instance_id`
    pub fn new(
        store: SharedStoreRef,
        keys: Keyspace,
        instance_id: impl Into<String>,
        config: ProxyPoolConfig,
    ) -> Self {
        Self {
            store,
            keys,
            instance_id: instance_id.into(),
            config,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    /// Replace the shared proxy list with `proxies`
    ///
    /// Entries no longer listed are removed along with their failure count;
    /// leases on them run out by TTL. Returns the number of listed proxies.
    pub async fn sync(&self, proxies: &[ProxyAddress]) -> Result<usize, ProxyError> {
        let list_key = self.keys.proxies();
        let wanted: HashSet<String> = proxies.iter().map(ProxyAddress::id).collect();

        for proxy in proxies {
            self.store.hset(&list_key, &proxy.id(), &proxy.to_uri()).await?;
        }

        let mut removed = 0;
        for id in self.store.hgetall(&list_key).await?.into_keys() {
            if !wanted.contains(&id) {
                self.store.hdel(&list_key, &id).await?;
                self.store.hdel(&self.keys.proxy_failures(), &id).await?;
                self.store.hdel(&self.keys.proxy_health(), &id).await?;
                removed += 1;
            }
        }

        info!(total = proxies.len(), removed, "Proxy list synchronized");
        Ok(proxies.len())
    }

    /// All proxies in the shared list
    pub async fn proxies(&self) -> StoreResult<Vec<ProxyAddress>> {
        let raw = self.store.hgetall(&self.keys.proxies()).await?;
        let mut proxies: Vec<ProxyAddress> = raw
            .into_iter()
            .filter_map(|(id, uri)| match uri.parse::<ProxyAddress>() {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!(proxy = %id, error = %e, "Skipping unreadable proxy entry");
                    None
                }
            })
            .collect();
        proxies.sort_by_key(ProxyAddress::id);
        Ok(proxies)
    }

    /// Consecutive failures per proxy id
    async fn failure_counts(&self) -> StoreResult<HashMap<String, u32>> {
        let raw = self.store.hgetall(&self.keys.proxy_failures()).await?;
        Ok(raw
            .into_iter()
            .map(|(id, n)| (id, n.parse::<u32>().unwrap_or(0)))
            .collect())
    }

    /// Proxies at or past the failure threshold
    pub async fn quarantined(&self) -> StoreResult<Vec<ProxyAddress>> {
        let failures = self.failure_counts().await?;
        Ok(self
            .proxies()
            .await?
            .into_iter()
            .filter(|p| failures.get(&p.id()).copied().unwrap_or(0) >= self.config.failure_threshold)
            .collect())
    }

    /// Lease up to `count` healthy, unleased proxies
    ///
    /// `None` takes every eligible proxy, subject to
    /// `max_proxies_per_instance`. An empty result is contention, not an
    /// error. Race losers are skipped rather than retried.
    pub async fn allocate(&self, count: Option<usize>) -> StoreResult<Vec<ProxyLease>> {
        let failures = self.failure_counts().await?;
        let mut candidates: Vec<ProxyAddress> = self
            .proxies()
            .await?
            .into_iter()
            .filter(|p| failures.get(&p.id()).copied().unwrap_or(0) < self.config.failure_threshold)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        let mut limit = count.unwrap_or(usize::MAX);
        if let Some(max) = self.config.max_proxies_per_instance {
            let held = self.held.lock().await.len();
            limit = limit.min(max.saturating_sub(held));
        }

        let mut leases = Vec::new();
        for proxy in candidates {
            if leases.len() >= limit {
                break;
            }
            if let Some(lease) = self.try_lease(&proxy).await? {
                leases.push(lease);
            }
        }

        metrics::record_proxy_allocation(leases.len());
        if leases.is_empty() {
            debug!(instance_id = %self.instance_id, "No proxy available");
        }
        Ok(leases)
    }

    /// Try to lease one specific proxy, regardless of health
    pub async fn try_lease(&self, proxy: &ProxyAddress) -> StoreResult<Option<ProxyLease>> {
        let id = proxy.id();
        let token = format!("{}/{}", self.instance_id, Uuid::new_v4().simple());

        if !self
            .store
            .set_if_absent(&self.keys.proxy_lease(&id), &token, self.config.lease_ttl())
            .await?
        {
            return Ok(None);
        }

        let lease = ProxyLease {
            proxy: proxy.clone(),
            token,
        };
        self.held.lock().await.insert(id.clone(), lease.clone());
        debug!(proxy = %id, "Proxy leased");
        Ok(Some(lease))
    }

    /// Return a lease; no-op when it is no longer ours
    pub async fn release(&self, lease: &ProxyLease) -> StoreResult<bool> {
        let id = lease.proxy_id();
        self.forget(&id, &lease.token).await;
        let released = self
            .store
            .delete_if_equals(&self.keys.proxy_lease(&id), &lease.token)
            .await?;
        debug!(proxy = %id, released, "Proxy lease returned");
        Ok(released)
    }

    /// Extend a held lease; false means it expired and may be someone else's
    pub async fn renew(&self, lease: &ProxyLease) -> StoreResult<bool> {
        let id = lease.proxy_id();
        let renewed = self
            .store
            .expire_if_equals(&self.keys.proxy_lease(&id), &lease.token, self.config.lease_ttl())
            .await?;
        if !renewed {
            warn!(proxy = %id, "Proxy lease lost");
            self.forget(&id, &lease.token).await;
        }
        Ok(renewed)
    }

    /// Release every lease this instance holds
    pub async fn release_all(&self) -> usize {
        let held: Vec<ProxyLease> = self.held.lock().await.drain().map(|(_, l)| l).collect();
        let mut released = 0;

        for lease in held {
            let id = lease.proxy_id();
            match self
                .store
                .delete_if_equals(&self.keys.proxy_lease(&id), &lease.token)
                .await
            {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => warn!(proxy = %id, error = %e, "Failed to release proxy lease"),
            }
        }

        released
    }

    /// Proxies this instance currently leases
    pub async fn held_proxies(&self) -> Vec<ProxyAddress> {
        self.held
            .lock()
            .await
            .values()
            .map(|l| l.proxy.clone())
            .collect()
    }

    /// Record the outcome of a request made through `proxy_id`
    ///
    /// The failure counter is the source of truth and is updated atomically.
    /// The health record is informational and written last-writer-wins.
    pub async fn report_result(
        &self,
        proxy_id: &str,
        success: bool,
        latency: Option<Duration>,
    ) -> StoreResult<()> {
        let failures_key = self.keys.proxy_failures();
        let consecutive_failures = if success {
            self.store.hdel(&failures_key, proxy_id).await?;
            0
        } else {
            let n = self.store.hincr(&failures_key, proxy_id, 1).await?;
            let n = u32::try_from(n.max(0)).unwrap_or(u32::MAX);
            if n == self.config.failure_threshold {
                warn!(
                    proxy = %proxy_id,
                    failures = n,
                    "Proxy marked unhealthy, excluded from allocation"
                );
            }
            n
        };

        let mut health = self.health(proxy_id).await?.unwrap_or_default();
        health.last_checked = Some(Utc::now());
        health.consecutive_failures = consecutive_failures;
        if let Some(latency) = latency.filter(|_| success) {
            health.last_latency_ms = Some(latency.as_millis() as u64);
        }

        let raw = serde_json::to_string(&health)
            .map_err(|e| crate::utils::error::StoreError::corrupt(proxy_id, e))?;
        self.store
            .hset(&self.keys.proxy_health(), proxy_id, &raw)
            .await
    }

    /// Last health observation, if any
    pub async fn health(&self, proxy_id: &str) -> StoreResult<Option<ProxyHealth>> {
        Ok(self
            .store
            .hget(&self.keys.proxy_health(), proxy_id)
            .await?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Whether a proxy is currently eligible for allocation
    pub async fn is_healthy(&self, proxy_id: &str) -> StoreResult<bool> {
        let failures = self.failure_counts().await?;
        Ok(failures.get(proxy_id).copied().unwrap_or(0) < self.config.failure_threshold)
    }

    /// Operator view of every proxy
    pub async fn snapshot(&self) -> StoreResult<Vec<ProxyRecord>> {
        let failures = self.failure_counts().await?;
        let mut records = Vec::new();

        for proxy in self.proxies().await? {
            let id = proxy.id();
            let lease_key = self.keys.proxy_lease(&id);
            let lease_owner = self
                .store
                .get(&lease_key)
                .await?
                .map(|token| lease_owner(&token).to_string());
            let lease_expiry = match lease_owner {
                Some(_) => self
                    .store
                    .ttl(&lease_key)
                    .await?
                    .map(|ttl| Utc::now() + chrono_duration(ttl)),
                None => None,
            };
            let health = self.health(&id).await?.unwrap_or_default();
            let healthy = failures.get(&id).copied().unwrap_or(0) < self.config.failure_threshold;

            records.push(ProxyRecord {
                authenticated: proxy.has_credentials(),
                id,
                health,
                healthy,
                lease_owner,
                lease_expiry,
            });
        }

        Ok(records)
    }

    async fn forget(&self, proxy_id: &str, token: &str) {
        let mut held = self.held.lock().await;
        if held.get(proxy_id).is_some_and(|l| l.token == token) {
            held.remove(proxy_id);
        }
    }
}

/// Instance id part of a lease token (`{instance_id}/{nonce}`)
fn lease_owner(token: &str) -> &str {
    token.rsplit_once('/').map_or(token, |(owner, _)| owner)
}
