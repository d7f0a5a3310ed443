use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use offerflow::metrics;
use offerflow::proxy::{ClientProvider, DirectClientProvider, ReqwestClientProvider};
use offerflow::server;

use super::{connect, shutdown_signal};

/// Options of the `worker` command
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub config: Option<PathBuf>,
    /// Connect directly instead of through the leased proxy
    pub direct: bool,
    /// Also run the scheduler loop in this process
    pub with_scheduler: bool,
}

pub async fn run_worker(params: WorkerParams) -> Result<()> {
    let runtime = connect(params.config.as_deref()).await?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let total = runtime.load_proxies().await.context("Failed to load proxy list")?;
    let known = runtime.proxies.proxies().await?.len();
    if known == 0 {
        tracing::warn!("Proxy pool is empty; every task will be deferred until proxies are loaded");
    }
    tracing::info!(
        instance_id = %runtime.instance_id,
        loaded = total,
        pool_size = known,
        "Starting worker"
    );

    let timeout = runtime.config.api.request_timeout();
    let clients: Arc<dyn ClientProvider> = if params.direct {
        Arc::new(DirectClientProvider::new(timeout))
    } else {
        Arc::new(ReqwestClientProvider::new(timeout))
    };

    let worker = runtime.worker(clients)?;
    let stop = worker.shutdown_handle();

    let scheduler = params.with_scheduler.then(|| {
        Arc::new(runtime.scheduler()).start(stop.subscribe())
    });

    let status_server = runtime.config.server.enabled.then(|| {
        let config = runtime.config.server.clone();
        let state = runtime.app_state();
        let mut rx = stop.subscribe();
        tokio::spawn(async move {
            let until_stopped = async move {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(e) = server::serve(&config, state, until_stopped).await {
                tracing::error!(error = %e, "Status server failed");
            }
        })
    });

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            stop.send_replace(true);
        });
    }

    let summary = worker.run().await?;

    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    if let Some(handle) = status_server {
        let _ = handle.await;
    }

    println!("Worker {} stopped", runtime.instance_id);
    println!("  Items claimed:      {}", summary.claimed);
    println!("  Aborted on exit:    {}", summary.aborted_on_shutdown);
    println!("  Locks released:     {}", summary.locks_released);
    println!("  Leases released:    {}", summary.leases_released);
    Ok(())
}
