//! Instance runtime
//!
//! A worker registers its instance, starts the heartbeat and proxy health
//! loops, then pulls work items off the shared queue and runs each one in
//! its own task. Failures and panics inside one item never reach the claim
//! loop.
//!
//! Shutdown stops claiming at once, gives in-flight items a grace period,
//! aborts what is left, then releases every lock and proxy lease this
//! instance still holds. Aborted items are not acked; the queue hands them
//! to another worker once their visibility deadline passes.

use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::coordination::{CoordinationConfig, InstanceCounters, InstanceRegistry, InstanceStatus};
use crate::error::Result;
use crate::fetcher::{Disposition, FetchContext, FetchOutcome, Fetcher};
use crate::metrics;
use crate::proxy::HealthProber;
use crate::queue::{Claimed, WorkQueue};
use crate::utils::retry::RetryPolicy;

// ============================================================================
// Configuration
// ============================================================================

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Work items processed concurrently by this instance
    pub max_in_flight: usize,

    /// Seconds one dequeue call waits for an item
    pub dequeue_timeout_secs: u64,

    /// Seconds in-flight items get to finish on shutdown
    pub shutdown_grace_secs: u64,

    /// Seconds a dequeued item may stay unacked before redelivery
    pub visibility_timeout_secs: u64,

    /// Re-enqueues of one run before a deferred item is dropped
    pub max_requeue_attempts: u32,

    /// Backoff between re-enqueues of a deferred item
    pub requeue_backoff: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            dequeue_timeout_secs: 5,
            shutdown_grace_secs: 30,
            visibility_timeout_secs: 600,
            max_requeue_attempts: 5,
            requeue_backoff: RetryPolicy::with_delays(5, 5_000, 300_000),
        }
    }
}

impl WorkerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Totals of one worker run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub claimed: u64,
    pub aborted_on_shutdown: usize,
    pub locks_released: usize,
    pub leases_released: usize,
}

/// Pulls work items and runs them through the fetcher
pub struct Worker {
    ctx: FetchContext,
    fetcher: Arc<Fetcher>,
    queue: Arc<WorkQueue>,
    registry: Arc<InstanceRegistry>,
    prober: Option<(Arc<HealthProber>, Duration)>,
    counters: Arc<InstanceCounters>,
    coordination: CoordinationConfig,
    config: WorkerConfig,
    shutdown: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        ctx: FetchContext,
        fetcher: Arc<Fetcher>,
        queue: Arc<WorkQueue>,
        registry: Arc<InstanceRegistry>,
        coordination: CoordinationConfig,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx,
            fetcher,
            queue,
            registry,
            prober: None,
            counters: Arc::new(InstanceCounters::default()),
            coordination,
            config,
            shutdown,
        }
    }

    /// Run proxy health probes every `interval` while the worker runs
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<HealthProber>, interval: Duration) -> Self {
        self.prober = Some((prober, interval));
        self
    }

    /// Sender that stops the worker when `true` is sent
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Counters reported in heartbeats
    pub fn counters(&self) -> Arc<InstanceCounters> {
        Arc::clone(&self.counters)
    }

    /// Run until shutdown is requested
    pub async fn run(&self) -> Result<WorkerSummary> {
        let instance_id = self.ctx.instance_id.clone();
        self.registry.register(&instance_id).await?;
        self.registry
            .set_status(&instance_id, InstanceStatus::Running)
            .await?;

        let heartbeat = Arc::clone(&self.registry).start_heartbeat(
            instance_id.clone(),
            Arc::clone(&self.counters),
            self.coordination.heartbeat_interval(),
            self.coordination.instance_expiry(),
            self.shutdown.subscribe(),
        );
        let prober = self.prober.as_ref().map(|(prober, interval)| {
            Arc::clone(prober).start(*interval, self.shutdown.subscribe())
        });
        info!(
            instance_id = %instance_id,
            max_in_flight = self.config.max_in_flight,
            "Worker running"
        );

        let mut tasks = JoinSet::new();
        let mut summary = WorkerSummary {
            claimed: self.claim_loop(&mut tasks).await,
            ..Default::default()
        };

        summary.aborted_on_shutdown = self.drain(&mut tasks).await;
        self.ctx.limiter.close().await;

        self.shutdown.send_replace(true);
        let _ = heartbeat.await;
        if let Some(handle) = prober {
            let _ = handle.await;
        }

        summary.locks_released = self.ctx.locks.release_all().await;
        summary.leases_released = self.ctx.proxies.release_all().await;
        if let Err(e) = self.registry.mark_stopped(&instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to mark instance stopped");
        }

        info!(
            instance_id = %instance_id,
            claimed = summary.claimed,
            aborted = summary.aborted_on_shutdown,
            locks_released = summary.locks_released,
            leases_released = summary.leases_released,
            "Worker stopped"
        );
        Ok(summary)
    }

    async fn claim_loop(&self, tasks: &mut JoinSet<()>) -> u64 {
        let slots = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut shutdown = self.shutdown.subscribe();
        let mut claimed = 0u64;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Work item task failed to join");
                    }
                    metrics::set_in_flight(tasks.len());
                }
                permit = Arc::clone(&slots).acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    if self.claim_one(permit, tasks, &shutdown).await {
                        claimed += 1;
                    }
                }
            }
        }

        debug!(in_flight = tasks.len(), "Stopped claiming work");
        claimed
    }

    /// Dequeue one item and spawn it; true when an item was spawned
    async fn claim_one(
        &self,
        permit: OwnedSemaphorePermit,
        tasks: &mut JoinSet<()>,
        shutdown: &watch::Receiver<bool>,
    ) -> bool {
        if let Err(e) = self.queue.promote_delayed(Utc::now()).await {
            warn!(error = %e, "Failed to promote delayed work items");
        }

        let claimed = match self.queue.dequeue(self.config.dequeue_timeout()).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Dequeue failed");
                tokio::time::sleep(self.config.dequeue_timeout().min(Duration::from_secs(1))).await;
                return false;
            }
        };

        if *shutdown.borrow() {
            // Claimed while shutting down; hand it straight back
            if let Err(e) = self.queue.enqueue(&claimed.item).await {
                warn!(task_key = %claimed.item.task_key, error = %e, "Failed to return work item");
            } else if let Err(e) = self.queue.ack(&claimed).await {
                warn!(task_key = %claimed.item.task_key, error = %e, "Failed to ack returned work item");
            }
            return false;
        }

        let fetcher = Arc::clone(&self.fetcher);
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let config = self.config.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let task_key = claimed.item.task_key.clone();

            let outcome = match AssertUnwindSafe(fetcher.process_task(&claimed.item))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(task_key = %task_key, "Work item panicked");
                    FetchOutcome {
                        task_key: task_key.clone(),
                        disposition: Disposition::Aborted,
                        published_count: 0,
                        invalid_records: 0,
                        pages: 0,
                        errors: vec!["panicked".to_string()],
                    }
                }
            };

            settle(&queue, &config, &claimed, &outcome).await;
            counters.record_task(outcome.published_count, outcome.errors.len() as u64);
        });
        metrics::set_in_flight(tasks.len());
        true
    }

    /// Wait out the grace period, then abort; returns the number aborted
    async fn drain(&self, tasks: &mut JoinSet<()>) -> usize {
        if tasks.is_empty() {
            return 0;
        }

        info!(in_flight = tasks.len(), "Waiting for in-flight work items");
        let finished = tokio::time::timeout(self.config.shutdown_grace(), async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Work item task failed to join");
                }
            }
        })
        .await;

        let remaining = tasks.len();
        if finished.is_err() {
            warn!(remaining, "Grace period expired, aborting in-flight work items");
            tasks.shutdown().await;
        }
        metrics::set_in_flight(0);
        remaining
    }
}

/// Ack or defer a finished item
///
/// A deferred copy is enqueued before the ack, so a crash in between
/// duplicates the item rather than losing it.
async fn settle(queue: &WorkQueue, config: &WorkerConfig, claimed: &Claimed, outcome: &FetchOutcome) {
    let item = &claimed.item;

    if outcome.disposition == Disposition::RetryLater {
        if item.attempt >= config.max_requeue_attempts {
            warn!(
                task_key = %item.task_key,
                attempts = item.attempt,
                "Dropping deferred work item after repeated deferrals"
            );
        } else {
            let next = item.next_attempt();
            let delay = config.requeue_backoff.delay(next.attempt);
            if let Err(e) = queue.enqueue_delayed(&next, delay).await {
                warn!(task_key = %item.task_key, error = %e, "Failed to defer work item");
                // Leave it in flight; visibility timeout redelivers it
                return;
            }
        }
    }

    if let Err(e) = queue.ack(claimed).await {
        warn!(task_key = %item.task_key, error = %e, "Failed to ack work item");
    }
}
