//! Periodic task scheduling
//!
//! Task definitions live in a shared hash keyed by `task_key`, so scheduling
//! is an idempotent upsert. Every tick the scheduler enqueues a work item for
//! each due task and advances its `next_run_at`. Due times are kept in a
//! second hash; a tick writes only that one and never rewrites a definition
//! that `schedule` may have replaced in the meantime. Ticks are serialized across
//! processes by the scheduler lock; a process that loses the lock skips the
//! tick.
//!
//! # Catch-up
//!
//! When `next_run_at + interval` is still in the past (nothing ran for a
//! while), the next run moves to `now + interval`. A backlog of missed runs
//! collapses into the single run enqueued by this tick.
//!
//! # Example
//!
//! ```ignore
//! use offerflow::scheduler::{Scheduler, SchedulerConfig};
//! use offerflow::models::{Task, TaskParams};
//!
//! let scheduler = Scheduler::new(store, keys, queue, locks, SchedulerConfig::default());
//! scheduler
//!     .schedule(&Task::new("cs2-usd", TaskParams::new("a8db"), Duration::from_secs(300)))
//!     .await?;
//!
//! let report = scheduler.tick(Utc::now()).await?;
//! println!("{} enqueued", report.enqueued);
//! ```

pub mod error;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordination::LockManager;
use crate::metrics;
use crate::models::Task;
use crate::queue::WorkQueue;
use crate::store::{Keyspace, SharedStoreRef};
use crate::utils::chrono_duration;
use crate::utils::retry::RetryPolicy;

pub use error::{SchedulerError, SchedulerResult};

/// Scheduler loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between ticks
    pub tick_interval_secs: u64,

    /// TTL of the tick lock in seconds
    pub lock_ttl_secs: u64,

    /// Backoff while another process holds the tick lock
    pub lock_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            lock_ttl_secs: 30,
            lock_retry: RetryPolicy::with_delays(2, 200, 2_000),
        }
    }
}

impl SchedulerConfig {
    /// Period of the scheduler loop
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Tick lock TTL
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Work items enqueued for due tasks
    pub enqueued: usize,
    /// Abandoned in-flight items handed back to the queue
    pub recovered: usize,
    /// Another process held the tick lock
    pub skipped: bool,
}

/// Next due time after a run at `now`
pub fn next_run_after(task: &Task, now: DateTime<Utc>) -> DateTime<Utc> {
    let interval = chrono_duration(task.interval());
    let next = task.next_run_at + interval;
    if next <= now {
        now + interval
    } else {
        next
    }
}

fn apply_next_run(task: &mut Task, raw: Option<&str>) {
    let Some(raw) = raw else { return };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => task.next_run_at = at.with_timezone(&Utc),
        Err(e) => warn!(task_key = %task.task_key, error = %e, "Ignoring unreadable next run time"),
    }
}

/// Stores schedules and turns due tasks into work items
pub struct Scheduler {
    store: SharedStoreRef,
    keys: Keyspace,
    queue: Arc<WorkQueue>,
    locks: Arc<LockManager>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: SharedStoreRef,
        keys: Keyspace,
        queue: Arc<WorkQueue>,
        locks: Arc<LockManager>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            keys,
            queue,
            locks,
            config,
        }
    }

    /// Insert or replace the schedule for `task.task_key`
    pub async fn schedule(&self, task: &Task) -> SchedulerResult<()> {
        task.validate()?;
        let json = serde_json::to_string(task)?;
        self.store
            .hset(&self.keys.tasks(), &task.task_key, &json)
            .await
            .map_err(|e| SchedulerError::store_error("schedule task", e))?;
        self.set_next_run(&task.task_key, task.next_run_at).await?;

        info!(
            task_key = %task.task_key,
            interval_secs = task.interval_secs,
            priority = task.priority,
            next_run_at = %task.next_run_at,
            "Task scheduled"
        );
        Ok(())
    }

    /// Stored schedule for `task_key`
    pub async fn get(&self, task_key: &str) -> SchedulerResult<Option<Task>> {
        let raw = self
            .store
            .hget(&self.keys.tasks(), task_key)
            .await
            .map_err(|e| SchedulerError::store_error("get task", e))?;
        let Some(json) = raw else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_str(&json)?;

        let next_run = self
            .store
            .hget(&self.keys.task_runs(), task_key)
            .await
            .map_err(|e| SchedulerError::store_error("get next run", e))?;
        apply_next_run(&mut task, next_run.as_deref());
        Ok(Some(task))
    }

    /// Every stored schedule, ordered by key
    ///
    /// Entries that fail to decode are logged and skipped.
    pub async fn tasks(&self) -> SchedulerResult<Vec<Task>> {
        let raw = self
            .store
            .hgetall(&self.keys.tasks())
            .await
            .map_err(|e| SchedulerError::store_error("list tasks", e))?;
        let runs = self
            .store
            .hgetall(&self.keys.task_runs())
            .await
            .map_err(|e| SchedulerError::store_error("list next runs", e))?;

        let mut tasks: Vec<Task> = raw
            .into_iter()
            .filter_map(|(key, json)| match serde_json::from_str::<Task>(&json) {
                Ok(mut task) => {
                    apply_next_run(&mut task, runs.get(&key).map(String::as_str));
                    Some(task)
                }
                Err(e) => {
                    warn!(task_key = %key, error = %e, "Skipping undecodable task");
                    None
                }
            })
            .collect();
        tasks.sort_by(|a, b| a.task_key.cmp(&b.task_key));
        Ok(tasks)
    }

    /// Delete a schedule
    pub async fn remove(&self, task_key: &str) -> SchedulerResult<()> {
        let existed = self
            .store
            .hdel(&self.keys.tasks(), task_key)
            .await
            .map_err(|e| SchedulerError::store_error("remove task", e))?;
        self.store
            .hdel(&self.keys.task_runs(), task_key)
            .await
            .map_err(|e| SchedulerError::store_error("remove next run", e))?;
        if !existed {
            return Err(SchedulerError::task_not_found(task_key));
        }
        info!(task_key = %task_key, "Task removed");
        Ok(())
    }

    /// Tasks with `next_run_at <= now`
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<Task>> {
        Ok(self
            .tasks()
            .await?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect())
    }

    /// Run one scheduling pass at `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let lock = self
            .locks
            .acquire_with_retry(
                &self.keys.scheduler_lock(),
                self.config.lock_ttl(),
                &self.config.lock_retry,
            )
            .await
            .map_err(|e| SchedulerError::store_error("acquire scheduler lock", e))?;

        let Some(lock) = lock else {
            debug!("Scheduler lock held elsewhere, skipping tick");
            return Ok(TickReport {
                skipped: true,
                ..Default::default()
            });
        };

        let result = self.enqueue_due(now).await;

        if let Err(e) = self.locks.release(&lock).await {
            warn!(error = %e, "Failed to release scheduler lock");
        }

        let report = result?;
        if report.enqueued > 0 || report.recovered > 0 {
            info!(
                enqueued = report.enqueued,
                recovered = report.recovered,
                "Scheduler tick"
            );
        }
        Ok(report)
    }

    async fn enqueue_due(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport {
            recovered: self
                .queue
                .requeue_expired(now)
                .await
                .map_err(|e| SchedulerError::store_error("requeue expired", e))?,
            ..Default::default()
        };

        let due = self.due_tasks(now).await?;
        report.enqueued = self.enqueue_tasks(due, now).await?;

        if let Ok(depth) = self.queue.len().await {
            metrics::set_queue_depth(depth);
        }
        Ok(report)
    }

    async fn enqueue_tasks(&self, due: Vec<Task>, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let mut enqueued = 0;
        for task in due {
            self.queue
                .enqueue(&task.work_item())
                .await
                .map_err(|e| SchedulerError::store_error("enqueue work item", e))?;

            let next_run_at = next_run_after(&task, now);
            self.set_next_run(&task.task_key, next_run_at).await?;

            debug!(task_key = %task.task_key, next_run_at = %next_run_at, "Task enqueued");
            enqueued += 1;
        }
        Ok(enqueued)
    }

    async fn set_next_run(&self, task_key: &str, at: DateTime<Utc>) -> SchedulerResult<()> {
        self.store
            .hset(&self.keys.task_runs(), task_key, &at.to_rfc3339())
            .await
            .map_err(|e| SchedulerError::store_error("advance task", e))
    }

    /// Start the scheduler loop
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick(Utc::now()).await {
                            warn!(error = %e, recoverable = e.is_recoverable(), "Scheduler tick failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        })
    }
}
