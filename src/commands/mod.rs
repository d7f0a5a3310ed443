pub mod proxies;
pub mod schedule;
pub mod status;
pub mod worker;

// Re-export command functions for convenience
pub use proxies::{list_proxies, load_proxies};
pub use schedule::{add_task, list_tasks, remove_task, run_scheduler, AddTaskParams};
pub use status::status;
pub use worker::{run_worker, WorkerParams};

use anyhow::{Context, Result};
use std::path::Path;

use offerflow::config::Config;
use offerflow::runtime::Runtime;

/// Load configuration and connect to the shared store
pub async fn connect(config_path: Option<&Path>) -> Result<Runtime> {
    let config = Config::load(config_path).context("Invalid configuration")?;
    Runtime::connect(config)
        .await
        .context("Failed to connect to the shared store")
}

/// Resolve once Ctrl+C (or SIGTERM on unix) arrives
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
