//! Status HTTP server
//!
//! - `GET /health`  - this instance's id and registry status
//! - `GET /status`  - registered instances, registry stats and queue depth
//! - `GET /metrics` - Prometheus text exposition

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::coordination::{InstanceRecord, InstanceRegistry, RegistryStats};
use crate::metrics;
use crate::queue::WorkQueue;

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the status endpoints at all
    pub enabled: bool,

    /// Listen address
    pub bind_address: SocketAddr,

    /// Log each request through `TraceLayer`
    pub enable_request_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: SocketAddr::from(([0, 0, 0, 0], 9100)),
            enable_request_logging: false,
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub instance_id: String,
    pub registry: Arc<InstanceRegistry>,
    pub queue: Arc<WorkQueue>,
    pub instance_expiry: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub instance_id: String,
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub instances: Vec<InstanceRecord>,
    pub stats: RegistryStats,
    pub queue: QueueDepth,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn unavailable(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

/// Build the status router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> axum::response::Response {
    match state.registry.get(&state.instance_id).await {
        Ok(record) => Json(HealthResponse {
            instance_id: state.instance_id.clone(),
            status: record
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "unregistered".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .into_response(),
        Err(e) => unavailable(e),
    }
}

async fn status(State(state): State<AppState>) -> axum::response::Response {
    let instances = match state.registry.instances().await {
        Ok(instances) => instances,
        Err(e) => return unavailable(e),
    };

    let depth = async {
        Ok::<_, crate::utils::error::StoreError>(QueueDepth {
            ready: state.queue.len().await?,
            delayed: state.queue.delayed_len().await?,
            in_flight: state.queue.in_flight_len().await?,
        })
    };
    let queue = match depth.await {
        Ok(queue) => queue,
        Err(e) => return unavailable(e),
    };

    let stats = RegistryStats::from_records(&instances, state.instance_expiry);
    Json(StatusResponse {
        instances,
        stats,
        queue,
    })
    .into_response()
}

async fn metrics_text() -> axum::response::Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Serve until `shutdown` resolves
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    serve_on(listener, config.enable_request_logging, state, shutdown).await
}

/// Serve on an already bound listener
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    request_logging: bool,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let mut router = create_router(state);
    if request_logging {
        router = router.layer(TraceLayer::new_for_http());
    }

    info!(addr = %listener.local_addr()?, "Status server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
