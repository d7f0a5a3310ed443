//! Proxy list, shared pool and health probing
//!
//! # Example
//!
//! ```rust,ignore
//! use offerflow::proxy::{load_proxy_file, ProxyPool, ProxyPoolConfig};
//!
//! let proxies = load_proxy_file("proxies.txt").await?;
//! let pool = ProxyPool::new(store, keys, instance_id, ProxyPoolConfig::default());
//! pool.sync(&proxies).await?;
//!
//! let leases = pool.allocate(Some(1)).await?;
//! ```

pub mod address;
pub mod health;
pub mod pool;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::retry::RetryPolicy;

pub use address::{load_proxy_file, parse_proxy_list, ProxyAddress, ProxyScheme};
pub use health::{ClientProvider, DirectClientProvider, HealthProber, ProbeReport, ReqwestClientProvider};
pub use pool::{ProxyHealth, ProxyLease, ProxyPool, ProxyRecord};

/// Proxy pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Proxy list file loaded into the shared pool at startup
    pub file: Option<PathBuf>,

    /// Lease TTL in seconds
    pub lease_ttl_secs: u64,

    /// Consecutive failures before a proxy is excluded
    pub failure_threshold: u32,

    /// Upper bound on leases one instance may hold
    pub max_proxies_per_instance: Option<usize>,

    /// Seconds between health probe rounds
    pub health_check_interval_secs: u64,

    /// Lightweight URL requested through each probed proxy
    pub probe_url: String,

    /// Probe request timeout in seconds
    pub probe_timeout_secs: u64,

    /// Backoff used while no proxy is available
    pub allocation_retry: RetryPolicy,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            file: None,
            lease_ttl_secs: 120,
            failure_threshold: 5,
            max_proxies_per_instance: None,
            health_check_interval_secs: 300,
            probe_url: "https://api.ipify.org".to_string(),
            probe_timeout_secs: 5,
            allocation_retry: RetryPolicy::with_delays(5, 500, 10_000),
        }
    }
}

impl ProxyPoolConfig {
    /// Lease TTL
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Health probe period
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
