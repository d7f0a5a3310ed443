//! Shared priority work queue
//!
//! Three sorted sets back the queue:
//!
//! - **ready**: score `-priority`, member `{seq:020}:{item json}`. The store
//!   breaks score ties by member, and `seq` comes from a store-wide counter,
//!   so equal priorities pop in enqueue order.
//! - **delayed**: score is the due time in epoch millis; promoted to ready
//!   once due.
//! - **in-flight**: score is the visibility deadline. `ack` removes an entry;
//!   entries past their deadline belong to a crashed worker and are handed
//!   back to ready.
//!
//! Moving an entry between sets is claimed with `ZREM`, so concurrent
//! promoters never duplicate an item. When the write to the destination
//! fails, the entry is put back where it came from.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::WorkItem;
use crate::store::{Keyspace, SharedStoreRef, StoreResult};
use crate::utils::chrono_duration;
use crate::utils::error::StoreError;

/// Entries moved per promotion or recovery pass
const BATCH: usize = 100;

/// A dequeued item; pass it back to [`WorkQueue::ack`] when done
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed {
    pub item: WorkItem,
    receipt: String,
}

impl Claimed {
    /// Opaque in-flight entry
    pub fn receipt(&self) -> &str {
        &self.receipt
    }
}

/// Priority queue of work items in the shared store
pub struct WorkQueue {
    store: SharedStoreRef,
    keys: Keyspace,
    visibility_timeout: Duration,
}

fn epoch_millis(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

impl WorkQueue {
    /// Create a queue; dequeued items not acked within `visibility_timeout`
    /// are redelivered
    pub fn new(store: SharedStoreRef, keys: Keyspace, visibility_timeout: Duration) -> Self {
        Self {
            store,
            keys,
            visibility_timeout,
        }
    }

    async fn encode(&self, item: &WorkItem) -> StoreResult<String> {
        let seq = self.store.incr(&self.keys.queue_sequence()).await?;
        let json = serde_json::to_string(item)
            .map_err(|e| StoreError::corrupt(self.keys.ready_queue(), e))?;
        Ok(format!("{seq:020}:{json}"))
    }

    fn decode(key: &str, member: &str) -> StoreResult<WorkItem> {
        let (_, json) = member
            .split_once(':')
            .ok_or_else(|| StoreError::corrupt(key, "missing sequence prefix"))?;
        serde_json::from_str(json).map_err(|e| StoreError::corrupt(key, e))
    }

    /// Add an item; higher `priority` is dequeued first
    pub async fn enqueue(&self, item: &WorkItem) -> StoreResult<()> {
        let member = self.encode(item).await?;
        self.store
            .zadd(&self.keys.ready_queue(), &member, -f64::from(item.priority))
            .await?;
        debug!(task_key = %item.task_key, priority = item.priority, "Work item enqueued");
        Ok(())
    }

    /// Wait up to `timeout` for the highest-priority item
    pub async fn dequeue(&self, timeout: Duration) -> StoreResult<Option<Claimed>> {
        let ready = self.keys.ready_queue();
        let Some((member, score)) = self.store.bzpopmin(&ready, timeout).await? else {
            return Ok(None);
        };

        let item = match Self::decode(&ready, &member) {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable work item");
                return Err(e);
            }
        };

        let deadline = Utc::now() + chrono_duration(self.visibility_timeout);
        if let Err(e) = self
            .store
            .zadd(&self.keys.inflight_queue(), &member, epoch_millis(deadline))
            .await
        {
            self.restore(&ready, &member, score).await;
            return Err(e);
        }

        Ok(Some(Claimed {
            item,
            receipt: member,
        }))
    }

    /// Mark a dequeued item as done; false when it was already recovered
    pub async fn ack(&self, claimed: &Claimed) -> StoreResult<bool> {
        self.store
            .zrem(&self.keys.inflight_queue(), &claimed.receipt)
            .await
    }

    /// Park an item until `delay` has passed
    pub async fn enqueue_delayed(&self, item: &WorkItem, delay: Duration) -> StoreResult<()> {
        let member = self.encode(item).await?;
        let due = Utc::now() + chrono_duration(delay);
        self.store
            .zadd(&self.keys.delayed_queue(), &member, epoch_millis(due))
            .await?;
        debug!(
            task_key = %item.task_key,
            attempt = item.attempt,
            delay_ms = delay.as_millis() as u64,
            "Work item delayed"
        );
        Ok(())
    }

    /// Move delayed items due at `now` to the ready set
    pub async fn promote_delayed(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let moved = self
            .move_due(&self.keys.delayed_queue(), now)
            .await?;
        if moved > 0 {
            debug!(count = moved, "Delayed work items promoted");
        }
        Ok(moved)
    }

    /// Return in-flight items whose deadline passed at `now` to the ready set
    pub async fn requeue_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let moved = self
            .move_due(&self.keys.inflight_queue(), now)
            .await?;
        if moved > 0 {
            info!(count = moved, "Abandoned work items requeued");
        }
        Ok(moved)
    }

    async fn move_due(&self, key: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let due = self
            .store
            .zrange_by_score(key, epoch_millis(now), BATCH)
            .await?;

        let mut moved = 0;
        for (member, score) in due {
            if !self.store.zrem(key, &member).await? {
                continue;
            }
            match Self::decode(key, &member) {
                Ok(item) => {
                    if let Err(e) = self.enqueue(&item).await {
                        self.restore(key, &member, score).await;
                        return Err(e);
                    }
                    moved += 1;
                }
                Err(e) => warn!(error = %e, "Dropping undecodable work item"),
            }
        }
        Ok(moved)
    }

    /// Put a removed entry back after a failed move
    async fn restore(&self, key: &str, member: &str, score: f64) {
        match self.store.zadd(key, member, score).await {
            Ok(()) => debug!(queue = %key, "Work item restored after failed move"),
            Err(e) => error!(queue = %key, error = %e, "Work item lost: could not restore after failed move"),
        }
    }

    /// Items ready to run
    pub async fn len(&self) -> StoreResult<u64> {
        self.store.zcard(&self.keys.ready_queue()).await
    }

    /// Whether no item is ready
    pub async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Items waiting in the delayed set
    pub async fn delayed_len(&self) -> StoreResult<u64> {
        self.store.zcard(&self.keys.delayed_queue()).await
    }

    /// Items dequeued but not yet acked
    pub async fn in_flight_len(&self) -> StoreResult<u64> {
        self.store.zcard(&self.keys.inflight_queue()).await
    }
}
