//! Retry utilities for resilient operations
//!
//! One backoff policy is shared by every retry loop in the pipeline: proxy
//! allocation, page fetches, lock contention and offer publishing.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,

    /// Random extra delay as a fraction of the computed delay (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// What a retry predicate decided about one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up and return the error
    Stop,
    /// Retry after the policy delay
    Retry,
    /// Retry after this delay instead (still capped by `max_delay_ms`)
    RetryAfter(Duration),
}

impl RetryPolicy {
    /// Create a new retry policy with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry policy with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// Disable jitter, mostly for deterministic tests
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }

    /// Delay before retry number `attempt`, with jitter applied and capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let spread = base.as_millis() as f64 * self.jitter;
        let extra = rand::thread_rng().gen_range(0.0..=spread) as u64;
        (base + Duration::from_millis(extra)).min(self.max_delay())
    }

    /// Cap applied to every delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Total number of attempts, first try included
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Execute an operation with retry logic and exponential backoff
///
/// Every error is retried until the policy is exhausted; the last error is
/// returned.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    with_retry_if(policy, operation, |_| RetryDecision::Retry).await
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// The predicate sees each error and decides whether to stop, retry with the
/// policy delay, or retry after a specific delay (for example a server
/// supplied `Retry-After`).
pub async fn with_retry_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut operation: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> RetryDecision,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                let decision = should_retry(&e);
                if decision == RetryDecision::Stop {
                    warn!(error = %e, "Non-retryable error encountered");
                    return Err(e);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }

                attempt += 1;
                let delay = match decision {
                    RetryDecision::RetryAfter(d) => d.min(policy.max_delay()),
                    _ => policy.delay(attempt),
                };

                warn!(
                    attempt = attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll an operation that yields `None` under contention until it yields a
/// value or the policy runs out
///
/// Used where "nothing available" is an expected outcome rather than an
/// error, such as allocating proxies or taking a contended lock.
pub async fn poll_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 0..policy.max_attempts() {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Resource contended, backing off"
            );
            tokio::time::sleep(delay).await;
        }

        if let Some(value) = operation().await {
            return Some(value);
        }
    }

    None
}
