use anyhow::{Context, Result};
use std::path::PathBuf;

use offerflow::proxy::load_proxy_file;

use super::connect;

/// Replace the shared proxy list with the contents of `file`
pub async fn load_proxies(config: Option<PathBuf>, file: PathBuf) -> Result<()> {
    let proxies = load_proxy_file(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let runtime = connect(config.as_deref()).await?;
    let total = runtime.proxies.sync(&proxies).await?;
    println!("Loaded {} proxies from {} ({} in pool)", proxies.len(), file.display(), total);
    Ok(())
}

pub async fn list_proxies(config: Option<PathBuf>) -> Result<()> {
    let runtime = connect(config.as_deref()).await?;
    let records = runtime.proxies.snapshot().await?;

    if records.is_empty() {
        println!("Proxy pool is empty");
        return Ok(());
    }

    println!("{:<32} {:<9} {:>8} {:>10}  LEASED BY", "PROXY", "HEALTHY", "FAILURES", "LATENCY");
    for record in records {
        let latency = record
            .health
            .last_latency_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<9} {:>8} {:>10}  {}",
            record.id,
            if record.healthy { "yes" } else { "no" },
            record.health.consecutive_failures,
            latency,
            record.lease_owner.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
