use anyhow::Result;
use std::path::PathBuf;

use offerflow::coordination::RegistryStats;

use super::connect;

pub async fn status(config: Option<PathBuf>) -> Result<()> {
    let runtime = connect(config.as_deref()).await?;
    let expiry = runtime.config.coordination.instance_expiry();
    let instances = runtime.registry.instances().await?;

    println!("{}", RegistryStats::from_records(&instances, expiry).display());
    println!();

    let now = chrono::Utc::now();
    for record in &instances {
        let stale = if record.is_stale(expiry, now) { " STALE" } else { "" };
        println!(
            "{:<40} {:<12} heartbeat {}s ago, {} tasks, {} offers{}",
            record.instance_id,
            record.status,
            record.seconds_since_heartbeat(),
            record.tasks_processed,
            record.offers_published,
            stale
        );
    }

    println!();
    println!("Queue");
    println!("  Ready:     {}", runtime.queue.len().await?);
    println!("  Delayed:   {}", runtime.queue.delayed_len().await?);
    println!("  In flight: {}", runtime.queue.in_flight_len().await?);
    Ok(())
}
