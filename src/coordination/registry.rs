//! Instance registry for tracking pipeline instances
//!
//! Every process writes its own record into a shared hash and refreshes it
//! with periodic heartbeats, which are also published on a pub/sub channel.
//! Stale instances are reported only; whatever locks they held expire on
//! their own TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::store::{Keyspace, SharedStoreRef, StoreResult};
use crate::utils::chrono_duration;
use crate::utils::error::StoreError;

// ============================================================================
// Instance Status
// ============================================================================

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Registered, background tasks starting
    Initializing,

    /// Pulling work
    Running,

    /// Shut down cleanly
    Stopped,
}

impl InstanceStatus {
    /// Label used in logs and the status endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Instance Record
// ============================================================================

/// Information about a registered instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Instance identifier
    pub instance_id: String,

    /// Current status
    pub status: InstanceStatus,

    /// Last heartbeat written
    pub last_heartbeat: DateTime<Utc>,

    /// When the instance registered
    pub started_at: DateTime<Utc>,

    /// Host the process runs on
    pub hostname: String,

    /// Version of the pipeline software
    pub version: String,

    /// Work items processed in this session
    #[serde(default)]
    pub tasks_processed: u64,

    /// Offers published in this session
    #[serde(default)]
    pub offers_published: u64,

    /// Errors recorded in this session
    #[serde(default)]
    pub errors: u64,
}

impl InstanceRecord {
    /// Create a record for a starting instance
    pub fn new(instance_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.into(),
            status: InstanceStatus::Initializing,
            last_heartbeat: now,
            started_at: now,
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            tasks_processed: 0,
            offers_published: 0,
            errors: 0,
        }
    }

    /// Check if heartbeat is older than `expiry` at `now`
    pub fn is_stale(&self, expiry: Duration, now: DateTime<Utc>) -> bool {
        self.status != InstanceStatus::Stopped && now - self.last_heartbeat > chrono_duration(expiry)
    }

    /// Get seconds since last heartbeat
    pub fn seconds_since_heartbeat(&self) -> i64 {
        (Utc::now() - self.last_heartbeat).num_seconds()
    }
}

/// Session counters reported with each heartbeat
#[derive(Debug, Default)]
pub struct InstanceCounters {
    tasks_processed: AtomicU64,
    offers_published: AtomicU64,
    errors: AtomicU64,
}

impl InstanceCounters {
    /// Record one processed work item
    pub fn record_task(&self, offers: u64, errors: u64) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        self.offers_published.fetch_add(offers, Ordering::Relaxed);
        self.errors.fetch_add(errors, Ordering::Relaxed);
    }

    /// Current values: tasks, offers, errors
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.tasks_processed.load(Ordering::Relaxed),
            self.offers_published.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

// ============================================================================
// Instance Registry
// ============================================================================

/// Registry of all pipeline instances, kept in the shared store
pub struct InstanceRegistry {
    store: SharedStoreRef,
    keys: Keyspace,
}

impl InstanceRegistry {
    /// Create a registry over the shared store
    pub fn new(store: SharedStoreRef, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Register (or re-register) an instance as initializing
    pub async fn register(&self, instance_id: &str) -> StoreResult<InstanceRecord> {
        let record = InstanceRecord::new(instance_id);
        self.write(&record).await?;
        self.write_status(instance_id, record.status).await?;
        info!(instance_id = %instance_id, hostname = %record.hostname, "Instance registered");
        Ok(record)
    }

    /// Get one instance record
    pub async fn get(&self, instance_id: &str) -> StoreResult<Option<InstanceRecord>> {
        let key = self.keys.instances();
        let mut record: InstanceRecord = match self.store.hget(&key, instance_id).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| StoreError::corrupt(format!("{key}.{instance_id}"), e))?,
            None => return Ok(None),
        };
        let status = self
            .store
            .hget(&self.keys.instance_status(), instance_id)
            .await?;
        if let Some(status) = status.as_deref().and_then(parse_status) {
            record.status = status;
        }
        Ok(Some(record))
    }

    /// Change an instance's status
    ///
    /// Only the status field is written; a concurrent heartbeat cannot undo it.
    pub async fn set_status(&self, instance_id: &str, status: InstanceStatus) -> StoreResult<()> {
        if self.store.hget(&self.keys.instances(), instance_id).await?.is_none() {
            self.write(&InstanceRecord::new(instance_id)).await?;
        }
        self.write_status(instance_id, status).await?;
        info!(instance_id = %instance_id, status = %status, "Instance status changed");
        Ok(())
    }

    /// Mark an instance stopped
    pub async fn mark_stopped(&self, instance_id: &str) -> StoreResult<()> {
        self.set_status(instance_id, InstanceStatus::Stopped).await
    }

    /// Refresh the heartbeat and counters, then announce it on the channel
    pub async fn heartbeat(
        &self,
        instance_id: &str,
        counters: &InstanceCounters,
    ) -> StoreResult<InstanceRecord> {
        let mut record = self
            .get(instance_id)
            .await?
            .unwrap_or_else(|| InstanceRecord::new(instance_id));
        let (tasks, offers, errors) = counters.snapshot();
        record.last_heartbeat = Utc::now();
        record.tasks_processed = tasks;
        record.offers_published = offers;
        record.errors = errors;

        let raw = self.write(&record).await?;
        self.store
            .publish(&self.keys.heartbeat_channel(), &raw)
            .await?;

        debug!(instance_id = %instance_id, tasks, offers, "Heartbeat sent");
        Ok(record)
    }

    /// Get all instances
    pub async fn instances(&self) -> StoreResult<Vec<InstanceRecord>> {
        let all = self.store.hgetall(&self.keys.instances()).await?;
        let statuses = self.store.hgetall(&self.keys.instance_status()).await?;
        let mut records: Vec<InstanceRecord> = all
            .into_iter()
            .filter_map(|(id, raw)| match serde_json::from_str::<InstanceRecord>(&raw) {
                Ok(mut record) => {
                    if let Some(status) = statuses.get(&id).and_then(|s| parse_status(s)) {
                        record.status = status;
                    }
                    Some(record)
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Skipping unreadable instance record");
                    None
                }
            })
            .collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        metrics::set_registered_instances(records.len());
        Ok(records)
    }

    /// Instances whose heartbeat is older than `expiry`
    pub async fn stale_instances(&self, expiry: Duration) -> StoreResult<Vec<InstanceRecord>> {
        let now = Utc::now();
        Ok(self
            .instances()
            .await?
            .into_iter()
            .filter(|r| r.is_stale(expiry, now))
            .collect())
    }

    /// Start the background heartbeat loop
    ///
    /// Runs until `shutdown` flips to true. Stale peers are logged each round.
    pub fn start_heartbeat(
        self: Arc<Self>,
        instance_id: String,
        counters: Arc<InstanceCounters>,
        interval: Duration,
        expiry: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match self.heartbeat(&instance_id, &counters).await {
                    Ok(_) => metrics::record_heartbeat(true),
                    Err(e) => {
                        metrics::record_heartbeat(false);
                        warn!(instance_id = %instance_id, error = %e, "Heartbeat failed");
                        continue;
                    }
                }

                match self.stale_instances(expiry).await {
                    Ok(stale) => {
                        for record in stale.iter().filter(|r| r.instance_id != instance_id) {
                            warn!(
                                instance_id = %record.instance_id,
                                seconds_since_heartbeat = record.seconds_since_heartbeat(),
                                "Instance missed heartbeats"
                            );
                        }
                    }
                    Err(e) => debug!(error = %e, "Stale instance check failed"),
                }
            }

            debug!(instance_id = %instance_id, "Heartbeat loop stopped");
        })
    }

    async fn write(&self, record: &InstanceRecord) -> StoreResult<String> {
        let raw = serde_json::to_string(record)
            .map_err(|e| StoreError::corrupt(&record.instance_id, e))?;
        self.store
            .hset(&self.keys.instances(), &record.instance_id, &raw)
            .await?;
        Ok(raw)
    }

    async fn write_status(&self, instance_id: &str, status: InstanceStatus) -> StoreResult<()> {
        self.store
            .hset(&self.keys.instance_status(), instance_id, status.as_str())
            .await
    }
}

fn parse_status(raw: &str) -> Option<InstanceStatus> {
    match raw {
        "initializing" => Some(InstanceStatus::Initializing),
        "running" => Some(InstanceStatus::Running),
        "stopped" => Some(InstanceStatus::Stopped),
        other => {
            warn!(status = %other, "Ignoring unknown instance status");
            None
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_instances: usize,
    pub initializing: usize,
    pub running: usize,
    pub stopped: usize,
    pub stale: usize,
    pub total_tasks: u64,
    pub total_offers: u64,
    pub total_errors: u64,
}

impl RegistryStats {
    /// Summarize a set of records
    pub fn from_records(records: &[InstanceRecord], expiry: Duration) -> Self {
        let now = Utc::now();
        let mut stats = Self {
            total_instances: records.len(),
            ..Default::default()
        };

        for record in records {
            match record.status {
                InstanceStatus::Initializing => stats.initializing += 1,
                InstanceStatus::Running => stats.running += 1,
                InstanceStatus::Stopped => stats.stopped += 1,
            }
            if record.is_stale(expiry, now) {
                stats.stale += 1;
            }
            stats.total_tasks += record.tasks_processed;
            stats.total_offers += record.offers_published;
            stats.total_errors += record.errors;
        }

        stats
    }

    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Registry Stats\n\
             {:-<30}\n\
             Total Instances: {}\n\
             - Initializing: {}\n\
             - Running: {}\n\
             - Stopped: {}\n\
             - Stale: {}\n\
             Total Tasks: {}\n\
             Total Offers: {}\n\
             Total Errors: {}",
            "",
            self.total_instances,
            self.initializing,
            self.running,
            self.stopped,
            self.stale,
            self.total_tasks,
            self.total_offers,
            self.total_errors
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
