//! Task processing: lock, lease, paginate, validate, publish
//!
//! One [`Fetcher::process_task`] call runs one work item end to end:
//!
//! 1. Take the task lock; a lost race is [`Disposition::Contended`].
//! 2. Lease one proxy under the allocation backoff; none left means
//!    [`Disposition::RetryLater`].
//! 3. Page through the listing API via the rate limiter, retrying transient
//!    failures. Exhausted retries or a fatal response abort the task, keeping
//!    what was already published.
//! 4. Validate and publish each record in order.
//! 5. Return the lease and the lock.

pub mod client;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::coordination::{LockManager, LockToken};
use crate::metrics;
use crate::models::{OfferMessage, ParsedOffer, TaskParams, WorkItem};
use crate::proxy::{ClientProvider, ProxyLease, ProxyPool};
use crate::publisher::Publisher;
use crate::ratelimit::RateLimiter;
use crate::store::Keyspace;
use crate::utils::error::FetchError;
use crate::utils::retry::{poll_with_backoff, with_retry_if, RetryDecision, RetryPolicy};

pub use client::{decode_body, ApiConfig, MarketClient, Page, PagePosition};

/// Pagination and retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Delay between pages in milliseconds
    pub page_delay_ms: u64,

    /// Page cap for tasks that do not set their own
    pub max_pages: u32,

    /// Retry policy for one page request
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_delay_ms: 500,
            max_pages: 1_000,
            retry: RetryPolicy::with_delays(3, 1_000, 30_000),
        }
    }
}

impl FetchConfig {
    /// Delay between pages
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}

/// How a task run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Pagination ran to its end
    Completed,
    /// Another instance holds the task lock
    Contended,
    /// No proxy or store unavailable; try again later
    RetryLater,
    /// Stopped part way; published offers stay published
    Aborted,
}

impl Disposition {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Contended => "contended",
            Self::RetryLater => "retry_later",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one task run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub task_key: String,
    pub disposition: Disposition,
    pub published_count: u64,
    pub invalid_records: u64,
    pub pages: u32,
    pub errors: Vec<String>,
}

impl FetchOutcome {
    fn new(task_key: &str) -> Self {
        Self {
            task_key: task_key.to_string(),
            disposition: Disposition::Completed,
            published_count: 0,
            invalid_records: 0,
            pages: 0,
            errors: Vec::new(),
        }
    }

    fn abort(&mut self, reason: impl Into<String>) {
        self.disposition = Disposition::Aborted;
        self.errors.push(reason.into());
    }
}

/// Shared components a fetcher works with
#[derive(Clone)]
pub struct FetchContext {
    pub instance_id: String,
    pub keys: Keyspace,
    pub locks: Arc<LockManager>,
    pub proxies: Arc<ProxyPool>,
    pub clients: Arc<dyn ClientProvider>,
    pub limiter: Arc<RateLimiter>,
    pub publisher: Arc<Publisher>,
}

/// Task lock and proxy lease held for one run
#[derive(Clone, Copy)]
struct Claims<'a> {
    lock: &'a LockToken,
    lease: &'a ProxyLease,
}

/// Runs work items against the marketplace API
pub struct Fetcher {
    ctx: FetchContext,
    market: MarketClient,
    config: FetchConfig,
    lock_ttl: Duration,
}

impl Fetcher {
    /// Create a fetcher; `lock_ttl` bounds how long a crashed holder blocks a task
    pub fn new(ctx: FetchContext, market: MarketClient, config: FetchConfig, lock_ttl: Duration) -> Self {
        Self {
            ctx,
            market,
            config,
            lock_ttl,
        }
    }

    /// Process one work item
    ///
    /// Never fails: every problem is reflected in the outcome's disposition
    /// and `errors`.
    pub async fn process_task(&self, item: &WorkItem) -> FetchOutcome {
        let mut outcome = FetchOutcome::new(&item.task_key);
        self.run(item, &mut outcome).await;

        metrics::record_task_outcome(outcome.disposition.as_str());
        match outcome.disposition {
            Disposition::Completed => info!(
                task_key = %item.task_key,
                pages = outcome.pages,
                published = outcome.published_count,
                invalid = outcome.invalid_records,
                "Task completed"
            ),
            Disposition::Aborted => error!(
                task_key = %item.task_key,
                published = outcome.published_count,
                errors = ?outcome.errors,
                "Task aborted"
            ),
            Disposition::Contended | Disposition::RetryLater => debug!(
                task_key = %item.task_key,
                disposition = %outcome.disposition,
                "Task not run"
            ),
        }
        outcome
    }

    async fn run(&self, item: &WorkItem, outcome: &mut FetchOutcome) {
        let lock_key = self.ctx.keys.task_lock(&item.task_key);
        let lock = match self.ctx.locks.acquire(&lock_key, self.lock_ttl).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                outcome.disposition = Disposition::Contended;
                return;
            }
            Err(e) => {
                warn!(task_key = %item.task_key, error = %e, "Could not take task lock");
                outcome.disposition = Disposition::RetryLater;
                outcome.errors.push(e.to_string());
                return;
            }
        };

        match self.lease_proxy().await {
            Some(lease) => {
                self.paginate(item, &lock, &lease, outcome).await;
                if let Err(e) = self.ctx.proxies.release(&lease).await {
                    warn!(task_key = %item.task_key, proxy = %lease.proxy(), error = %e, "Failed to release proxy lease");
                }
            }
            None => {
                warn!(task_key = %item.task_key, "No proxy available, deferring task");
                outcome.disposition = Disposition::RetryLater;
            }
        }

        if let Err(e) = self.ctx.locks.release(&lock).await {
            warn!(task_key = %item.task_key, error = %e, "Failed to release task lock");
        }
    }

    async fn lease_proxy(&self) -> Option<ProxyLease> {
        let policy = &self.ctx.proxies.config().allocation_retry;
        poll_with_backoff(policy, || async move {
            match self.ctx.proxies.allocate(Some(1)).await {
                Ok(mut leases) => leases.pop(),
                Err(e) => {
                    warn!(error = %e, "Proxy allocation failed");
                    None
                }
            }
        })
        .await
    }

    async fn paginate(
        &self,
        item: &WorkItem,
        lock: &LockToken,
        lease: &ProxyLease,
        outcome: &mut FetchOutcome,
    ) {
        let client = match self.ctx.clients.client_for(lease.proxy()) {
            Ok(client) => client,
            Err(e) => {
                outcome.abort(e.to_string());
                return;
            }
        };

        let proxy_id = lease.proxy_id();
        let params = &item.params;
        let max_pages = params.max_pages.unwrap_or(self.config.max_pages);
        let page_delay = params.page_delay().unwrap_or_else(|| self.config.page_delay());
        let mut position = PagePosition::Offset(0);

        for page_number in 0..max_pages {
            if page_number > 0 && !page_delay.is_zero() {
                tokio::time::sleep(page_delay).await;
            }

            let claims = Claims { lock, lease };
            let page = match self.fetch_page(&client, &proxy_id, claims, params, &position).await {
                Ok(page) => page,
                Err(e) => {
                    outcome.abort(format!("page {}: {e}", page_number + 1));
                    return;
                }
            };
            outcome.pages += 1;

            if page.records.is_empty() {
                debug!(task_key = %item.task_key, pages = outcome.pages, "Empty page, pagination finished");
                return;
            }

            self.publish_page(item, &page, outcome).await;

            position = match (page.cursor, position) {
                (Some(next), PagePosition::Cursor(prev)) if next == prev => {
                    debug!(task_key = %item.task_key, "Cursor did not advance, pagination finished");
                    return;
                }
                (Some(next), _) => PagePosition::Cursor(next),
                (None, PagePosition::Offset(offset)) => {
                    PagePosition::Offset(offset + u64::from(params.page_size))
                }
                (None, PagePosition::Cursor(_)) => return,
            };
        }

        debug!(task_key = %item.task_key, max_pages, "Page cap reached");
    }

    /// Renew the task lock and the proxy lease ahead of a request
    async fn keep_claims(&self, claims: Claims<'_>) -> Result<(), FetchError> {
        match self.ctx.locks.renew(claims.lock, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => return Err(FetchError::ClaimLost("task lock expired".to_string())),
            Err(e) => return Err(FetchError::ClaimLost(format!("task lock renewal failed: {e}"))),
        }
        match self.ctx.proxies.renew(claims.lease).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(FetchError::ClaimLost(format!(
                "proxy lease expired: {}",
                claims.lease.proxy()
            ))),
            Err(e) => Err(FetchError::ClaimLost(format!("proxy lease renewal failed: {e}"))),
        }
    }

    /// One page with retries, through the leased proxy's rate limit
    ///
    /// Every attempt renews both claims first, so backoff between retries
    /// never eats into the lease held for the request itself.
    async fn fetch_page(
        &self,
        client: &reqwest::Client,
        proxy_id: &str,
        claims: Claims<'_>,
        params: &TaskParams,
        position: &PagePosition,
    ) -> Result<Page, FetchError> {
        let result = with_retry_if(
            &self.config.retry,
            || async move {
                let _permit = self
                    .ctx
                    .limiter
                    .acquire_for_proxy(proxy_id)
                    .await
                    .map_err(|_| FetchError::Cancelled)?;
                self.keep_claims(claims).await?;

                let result = self.market.fetch_page(client, params, position).await;
                match &result {
                    Ok(page) => self.report(proxy_id, true, Some(page.latency)).await,
                    Err(e) => {
                        metrics::record_fetch_error(e.kind());
                        if e.blames_proxy() {
                            self.report(proxy_id, false, None).await;
                        }
                    }
                }
                result
            },
            |e: &FetchError| match e {
                e if !e.is_transient() => RetryDecision::Stop,
                FetchError::RateLimited {
                    retry_after: Some(delay),
                } => RetryDecision::RetryAfter(*delay),
                _ => RetryDecision::Retry,
            },
        )
        .await;

        result.map_err(|e| {
            if e.is_transient() {
                FetchError::MaxRetriesExceeded { last: e.to_string() }
            } else {
                e
            }
        })
    }

    async fn report(&self, proxy_id: &str, success: bool, latency: Option<Duration>) {
        if let Err(e) = self.ctx.proxies.report_result(proxy_id, success, latency).await {
            warn!(proxy = %proxy_id, error = %e, "Failed to record proxy result");
        }
    }

    async fn publish_page(&self, item: &WorkItem, page: &Page, outcome: &mut FetchOutcome) {
        let mut published = 0u64;
        let mut invalid = 0u64;

        for record in &page.records {
            let offer = match ParsedOffer::from_record(record, &item.params) {
                Ok(offer) => offer,
                Err(e) => {
                    debug!(task_key = %item.task_key, error = %e, "Skipping malformed record");
                    invalid += 1;
                    continue;
                }
            };

            let message = OfferMessage::new(item.task_key.as_str(), self.ctx.instance_id.as_str(), offer);
            match self.ctx.publisher.publish(&message).await {
                Ok(_) => published += 1,
                Err(e) => {
                    warn!(
                        task_key = %item.task_key,
                        item_id = %message.offer.item_id,
                        error = %e,
                        "Failed to publish offer"
                    );
                    metrics::record_publish_failure();
                    outcome.errors.push(e.to_string());
                }
            }
        }

        outcome.published_count += published;
        outcome.invalid_records += invalid;
        metrics::record_page(published, invalid, page.latency.as_secs_f64());
    }
}
