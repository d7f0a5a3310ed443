use anyhow::Result;
use clap::{Parser, Subcommand};
use offerflow::config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{AddTaskParams, WorkerParams};

#[derive(Parser)]
#[command(
    name = "offerflow",
    version,
    about = "Distributed, proxy-aware marketplace listing ingestion",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configured format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker instance
    Worker {
        /// Connect directly instead of through leased proxies
        #[arg(long, default_value = "false")]
        direct: bool,

        /// Also run the scheduler loop in this process
        #[arg(long, default_value = "false")]
        with_scheduler: bool,
    },

    /// Run the scheduler loop only
    Scheduler,

    /// Manage task schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Manage the shared proxy pool
    Proxies {
        #[command(subcommand)]
        action: ProxyAction,
    },

    /// Show registered instances and queue depth
    Status,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// Add or replace a task
    Add {
        /// Unique task key
        #[arg(short, long)]
        key: String,

        /// Marketplace game id
        #[arg(short, long)]
        game_id: String,

        /// Price currency
        #[arg(long, default_value = "USD")]
        currency: String,

        /// Seconds between runs
        #[arg(short, long, default_value = "300")]
        interval: u64,

        /// Higher runs first
        #[arg(short, long, default_value = "0")]
        priority: i32,

        /// Records per page
        #[arg(long, default_value = "100")]
        page_size: u32,

        /// Page cap per run
        #[arg(long)]
        max_pages: Option<u32>,

        /// Extra query parameter (key=value), repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,
    },

    /// List tasks
    List,

    /// Remove a task
    Remove {
        /// Task key
        key: String,
    },
}

#[derive(Subcommand)]
enum ProxyAction {
    /// Replace the pool with a proxy list file
    Load {
        /// One proxy URI per line
        file: PathBuf,
    },

    /// Show proxies with health and lease owner
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from config when it loads; the command reports
    // configuration errors itself
    let logging = Config::load(cli.config.as_deref())
        .map(|c| c.logging)
        .unwrap_or_default();
    let format = cli.log_format.unwrap_or(logging.format);
    setup_tracing(&format, &logging.level, cli.verbose)?;

    let config = cli.config;

    match cli.command {
        Commands::Worker {
            direct,
            with_scheduler,
        } => {
            tracing::info!(direct, with_scheduler, "Starting worker command");
            commands::run_worker(WorkerParams {
                config,
                direct,
                with_scheduler,
            })
            .await?;
        }

        Commands::Scheduler => {
            commands::run_scheduler(config).await?;
        }

        Commands::Schedule { action } => match action {
            ScheduleAction::Add {
                key,
                game_id,
                currency,
                interval,
                priority,
                page_size,
                max_pages,
                filters,
            } => {
                commands::add_task(
                    config,
                    AddTaskParams {
                        task_key: key,
                        game_id,
                        currency,
                        interval_secs: interval,
                        priority,
                        page_size,
                        max_pages,
                        filters,
                    },
                )
                .await?;
            }
            ScheduleAction::List => commands::list_tasks(config).await?,
            ScheduleAction::Remove { key } => commands::remove_task(config, key).await?,
        },

        Commands::Proxies { action } => match action {
            ProxyAction::Load { file } => commands::load_proxies(config, file).await?,
            ProxyAction::List => commands::list_proxies(config).await?,
        },

        Commands::Status => commands::status(config).await?,
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { level };
    let default_filter = format!("offerflow={level},warn");
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}
