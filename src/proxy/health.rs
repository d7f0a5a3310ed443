//! Per-proxy HTTP clients and the background health prober

use rand::seq::SliceRandom;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::address::ProxyAddress;
use super::pool::ProxyPool;
use crate::utils::error::ProxyError;

/// Pool of realistic User-Agent strings for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
];

/// Builds the HTTP client used for requests through a proxy
pub trait ClientProvider: Send + Sync {
    /// Client whose traffic goes through `proxy`
    fn client_for(&self, proxy: &ProxyAddress) -> Result<Client, ProxyError>;
}

fn client_error(proxy: &ProxyAddress, err: reqwest::Error) -> ProxyError {
    ProxyError::Client {
        proxy: proxy.id(),
        reason: err.to_string(),
    }
}

/// Routes every request through the leased proxy
#[derive(Debug, Clone)]
pub struct ReqwestClientProvider {
    timeout: Duration,
}

impl ReqwestClientProvider {
    /// Create a provider with a per-request timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientProvider for ReqwestClientProvider {
    fn client_for(&self, proxy: &ProxyAddress) -> Result<Client, ProxyError> {
        let route = reqwest::Proxy::all(proxy.to_uri()).map_err(|e| client_error(proxy, e))?;
        let user_agent = USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);

        Client::builder()
            .proxy(route)
            .timeout(self.timeout)
            .gzip(true)
            .user_agent(user_agent)
            .build()
            .map_err(|e| client_error(proxy, e))
    }
}

/// Ignores the proxy and connects directly
///
/// For single-node runs without a proxy list and for tests against a local
/// mock server. Leases are still taken so coordination behaves the same.
#[derive(Debug, Clone)]
pub struct DirectClientProvider {
    timeout: Duration,
}

impl DirectClientProvider {
    /// Create a provider with a per-request timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ClientProvider for DirectClientProvider {
    fn client_for(&self, proxy: &ProxyAddress) -> Result<Client, ProxyError> {
        Client::builder()
            .no_proxy()
            .timeout(self.timeout)
            .build()
            .map_err(|e| client_error(proxy, e))
    }
}

/// Result of one probe round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Proxies probed
    pub checked: usize,
    /// Probes that succeeded
    pub healthy: usize,
    /// Quarantined proxies that answered again
    pub recovered: usize,
    /// Probes that failed
    pub failed: usize,
}

/// Periodically checks proxies and feeds results back into the pool
pub struct HealthProber {
    pool: Arc<ProxyPool>,
    clients: Arc<dyn ClientProvider>,
    probe_url: String,
}

impl HealthProber {
    /// Create a prober requesting `probe_url` through each proxy
    pub fn new(
        pool: Arc<ProxyPool>,
        clients: Arc<dyn ClientProvider>,
        probe_url: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            clients,
            probe_url: probe_url.into(),
        }
    }

    /// Request the probe URL through `proxy`, returning its latency
    pub async fn probe(&self, proxy: &ProxyAddress) -> Result<Duration, String> {
        let client = self.clients.client_for(proxy).map_err(|e| e.to_string())?;
        let started = Instant::now();

        let response = client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(started.elapsed())
        } else {
            Err(format!("probe returned {}", response.status()))
        }
    }

    /// Probe every proxy this instance leases, plus quarantined proxies
    /// it can lease briefly
    pub async fn run_once(&self) -> ProbeReport {
        let mut report = ProbeReport::default();

        for proxy in self.pool.held_proxies().await {
            let ok = self.check(&proxy).await;
            report.record(ok, false);
        }

        let quarantined = match self.pool.quarantined().await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "Could not list quarantined proxies");
                return report;
            }
        };

        for proxy in quarantined {
            let lease = match self.pool.try_lease(&proxy).await {
                Ok(Some(lease)) => lease,
                Ok(None) => continue,
                Err(e) => {
                    warn!(proxy = %proxy, error = %e, "Could not lease proxy for probing");
                    continue;
                }
            };

            let ok = self.check(&proxy).await;
            if ok {
                info!(proxy = %proxy, "Quarantined proxy recovered");
            }
            report.record(ok, ok);

            if let Err(e) = self.pool.release(&lease).await {
                warn!(proxy = %proxy, error = %e, "Failed to release probe lease");
            }
        }

        debug!(
            checked = report.checked,
            healthy = report.healthy,
            recovered = report.recovered,
            failed = report.failed,
            "Proxy health round finished"
        );
        report
    }

    async fn check(&self, proxy: &ProxyAddress) -> bool {
        let id = proxy.id();
        let (ok, latency) = match self.probe(proxy).await {
            Ok(latency) => (true, Some(latency)),
            Err(reason) => {
                debug!(proxy = %id, reason = %reason, "Proxy probe failed");
                (false, None)
            }
        };

        if let Err(e) = self.pool.report_result(&id, ok, latency).await {
            warn!(proxy = %id, error = %e, "Failed to record probe result");
        }
        ok
    }

    /// Start the background probe loop
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; leases are not taken yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!("Proxy health prober stopped");
        })
    }
}

impl ProbeReport {
    fn record(&mut self, ok: bool, recovered: bool) {
        self.checked += 1;
        if ok {
            self.healthy += 1;
        } else {
            self.failed += 1;
        }
        if recovered {
            self.recovered += 1;
        }
    }
}
