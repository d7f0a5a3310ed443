use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use offerflow::models::{Task, TaskParams};

use super::{connect, shutdown_signal};

/// Options of `schedule add`
#[derive(Debug, Clone)]
pub struct AddTaskParams {
    pub task_key: String,
    pub game_id: String,
    pub currency: String,
    pub interval_secs: u64,
    pub priority: i32,
    pub page_size: u32,
    pub max_pages: Option<u32>,
    /// `key=value` query filters
    pub filters: Vec<String>,
}

pub async fn add_task(config: Option<PathBuf>, params: AddTaskParams) -> Result<()> {
    let mut task_params = TaskParams::new(params.game_id);
    task_params.currency = params.currency;
    task_params.page_size = params.page_size;
    task_params.max_pages = params.max_pages;
    for filter in &params.filters {
        let Some((key, value)) = filter.split_once('=') else {
            bail!("Filter '{filter}' must be key=value");
        };
        task_params
            .filters
            .insert(key.trim().to_string(), value.trim().to_string());
    }

    let task = Task::new(
        params.task_key,
        task_params,
        Duration::from_secs(params.interval_secs),
    )
    .with_priority(params.priority);

    let runtime = connect(config.as_deref()).await?;
    runtime
        .scheduler()
        .schedule(&task)
        .await
        .context("Failed to schedule task")?;

    println!("Scheduled '{}' every {}s (priority {})", task.task_key, task.interval_secs, task.priority);
    Ok(())
}

pub async fn list_tasks(config: Option<PathBuf>) -> Result<()> {
    let runtime = connect(config.as_deref()).await?;
    let tasks = runtime.scheduler().tasks().await?;

    if tasks.is_empty() {
        println!("No tasks scheduled");
        return Ok(());
    }

    let now = Utc::now();
    println!("{:<24} {:<10} {:>8} {:>9}  NEXT RUN", "TASK", "GAME", "PRIORITY", "INTERVAL");
    for task in tasks {
        let due = if task.is_due(now) { " (due)" } else { "" };
        println!(
            "{:<24} {:<10} {:>8} {:>8}s  {}{}",
            task.task_key,
            task.params.game_id,
            task.priority,
            task.interval_secs,
            task.next_run_at.format("%Y-%m-%d %H:%M:%S UTC"),
            due
        );
    }
    Ok(())
}

pub async fn remove_task(config: Option<PathBuf>, task_key: String) -> Result<()> {
    let runtime = connect(config.as_deref()).await?;
    runtime.scheduler().remove(&task_key).await?;
    println!("Removed '{task_key}'");
    Ok(())
}

/// Run only the scheduler loop until a shutdown signal
pub async fn run_scheduler(config: Option<PathBuf>) -> Result<()> {
    let runtime = connect(config.as_deref()).await?;
    let (stop, rx) = tokio::sync::watch::channel(false);

    tracing::info!(
        instance_id = %runtime.instance_id,
        tick_secs = runtime.config.scheduler.tick_interval_secs,
        "Starting scheduler"
    );
    let handle = Arc::new(runtime.scheduler()).start(rx);

    shutdown_signal().await;
    stop.send_replace(true);
    let _ = handle.await;
    Ok(())
}
