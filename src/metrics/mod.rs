//! Prometheus metrics for the offerflow pipeline
//!
//! This module provides metrics tracking for:
//! - Coordination: instance heartbeats, lock contention
//! - Fetching: pages, offers, invalid records, errors by kind, proxy allocation
//! - Worker: queue depth, in-flight tasks, task outcomes
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Encoder, Gauge, Histogram, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for coordination metrics
struct CoordinationMetrics {
    heartbeats: Counter,
    heartbeat_errors: Counter,
    registered_instances: Gauge,
    lock_contention: Counter,
}

/// Container for fetch and worker metrics
struct PipelineMetrics {
    offers_published: Counter,
    invalid_records: Counter,
    publish_failures: Counter,
    fetch_errors: CounterVec,
    proxy_allocations: CounterVec,
    page_latency: Histogram,
    task_outcomes: CounterVec,
    queue_depth: Gauge,
    in_flight: Gauge,
}

/// Global storage for coordination metrics
static COORDINATION_METRICS: OnceLock<CoordinationMetrics> = OnceLock::new();

/// Global storage for pipeline metrics
static PIPELINE_METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = offerflow::metrics::init_metrics() {
///     tracing::warn!(error = %e, "Metrics initialization failed");
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let coordination = CoordinationMetrics {
        heartbeats: register_counter!(
            "offerflow_heartbeats_total",
            "Total number of heartbeats written by this instance"
        )?,
        heartbeat_errors: register_counter!(
            "offerflow_heartbeat_errors_total",
            "Total number of failed heartbeat writes"
        )?,
        registered_instances: register_gauge!(
            "offerflow_registered_instances",
            "Number of instances in the shared registry"
        )?,
        lock_contention: register_counter!(
            "offerflow_lock_contention_total",
            "Lock acquisitions lost to another owner"
        )?,
    };

    let pipeline = PipelineMetrics {
        offers_published: register_counter!(
            "offerflow_offers_published_total",
            "Offers confirmed by the outbound transport"
        )?,
        invalid_records: register_counter!(
            "offerflow_invalid_records_total",
            "Upstream records dropped by validation"
        )?,
        publish_failures: register_counter!(
            "offerflow_publish_failures_total",
            "Offers that could not be delivered"
        )?,
        fetch_errors: register_counter_vec!(
            "offerflow_fetch_errors_total",
            "Page fetch failures by kind",
            &["kind"]
        )?,
        proxy_allocations: register_counter_vec!(
            "offerflow_proxy_allocations_total",
            "Proxy allocation attempts by result",
            &["result"]
        )?,
        page_latency: register_histogram!(
            "offerflow_page_latency_seconds",
            "Latency of successful page fetches in seconds",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        task_outcomes: register_counter_vec!(
            "offerflow_task_outcomes_total",
            "Processed work items by disposition",
            &["disposition"]
        )?,
        queue_depth: register_gauge!(
            "offerflow_queue_depth",
            "Ready work items observed in the shared queue"
        )?,
        in_flight: register_gauge!(
            "offerflow_in_flight_tasks",
            "Work items currently processed by this instance"
        )?,
    };

    // Store metrics - these should always succeed since we just created them
    COORDINATION_METRICS
        .set(coordination)
        .map_err(|_| "Coordination metrics already initialized")?;
    PIPELINE_METRICS
        .set(pipeline)
        .map_err(|_| "Pipeline metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    COORDINATION_METRICS.get().is_some() && PIPELINE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a heartbeat write
pub fn record_heartbeat(ok: bool) {
    let Some(m) = COORDINATION_METRICS.get() else {
        return;
    };

    if ok {
        m.heartbeats.inc();
    } else {
        m.heartbeat_errors.inc();
    }
}

/// Update the registered instance gauge
pub fn set_registered_instances(count: usize) {
    if let Some(m) = COORDINATION_METRICS.get() {
        m.registered_instances.set(count as f64);
    }
}

/// Record a lost lock race
pub fn record_lock_contention() {
    if let Some(m) = COORDINATION_METRICS.get() {
        m.lock_contention.inc();
    }
}

/// Record the outcome of a fetched page
pub fn record_page(offers: u64, invalid: u64, latency_secs: f64) {
    let Some(m) = PIPELINE_METRICS.get() else {
        return;
    };

    if offers > 0 {
        m.offers_published.inc_by(offers as f64);
    }
    if invalid > 0 {
        m.invalid_records.inc_by(invalid as f64);
    }
    m.page_latency.observe(latency_secs);
}

/// Record an offer that could not be delivered
pub fn record_publish_failure() {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.publish_failures.inc();
    }
}

/// Record a page fetch failure
pub fn record_fetch_error(kind: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.fetch_errors.with_label_values(&[kind]).inc();
    }
}

/// Record a proxy allocation attempt
pub fn record_proxy_allocation(leased: usize) {
    if let Some(m) = PIPELINE_METRICS.get() {
        let result = if leased > 0 { "leased" } else { "exhausted" };
        m.proxy_allocations.with_label_values(&[result]).inc();
    }
}

/// Record a processed work item
pub fn record_task_outcome(disposition: &str) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.task_outcomes.with_label_values(&[disposition]).inc();
    }
}

/// Update the queue depth gauge
pub fn set_queue_depth(depth: u64) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

/// Update the in-flight gauge
pub fn set_in_flight(count: usize) {
    if let Some(m) = PIPELINE_METRICS.get() {
        m.in_flight.set(count as f64);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok());

        // Second call should also be Ok (idempotent)
        let result2 = init_metrics();
        assert!(result2.is_ok());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_task_outcome("completed");
        let text = encode_metrics().unwrap();
        assert!(text.contains("offerflow_task_outcomes_total") || !metrics_initialized());
    }

    #[test]
    fn test_pipeline_metrics() {
        ensure_metrics_initialized();
        record_page(10, 2, 0.3);
        record_fetch_error("timeout");
        record_proxy_allocation(0);
        record_publish_failure();
        set_queue_depth(4);
        set_in_flight(2);
    }

    #[test]
    fn test_metrics_noop_without_init() {
        // These should not panic even if called before initialization
        record_heartbeat(true);
        record_heartbeat(false);
        set_registered_instances(3);
        record_lock_contention();
        record_page(1, 0, 0.01);
    }
}
