//! Cross-instance coordination
//!
//! Per-task distributed locks, the instance registry and heartbeats. Every
//! piece of state lives in the shared store; nothing here is process-global.

pub mod lock;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use lock::{LockManager, LockToken};
pub use registry::{
    InstanceCounters, InstanceRecord, InstanceRegistry, InstanceStatus, RegistryStats,
};

/// Coordination timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// TTL of a per-task lock in seconds
    pub lock_ttl_secs: u64,

    /// Seconds between heartbeats
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before an instance is reported stale
    pub instance_expiry_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 300,
            heartbeat_interval_secs: 30,
            instance_expiry_secs: 90,
        }
    }
}

impl CoordinationConfig {
    /// Per-task lock TTL
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Staleness threshold
    pub fn instance_expiry(&self) -> Duration {
        Duration::from_secs(self.instance_expiry_secs)
    }
}
