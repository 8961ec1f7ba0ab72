//! Gleaner: scheduled web scraping
//!
//! Main binary with subcommands:
//! - `job`: Create, inspect and control scraping jobs
//! - `config`: Inspect stored fetch configurations
//! - `scheduler`: Run the job scheduler in the foreground

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gleaner_scheduler::{JobManager, JobStore};
use gleaner_scrape::DirConfigResolver;

/// Parse boolean from environment variable, accepting common truthy values.
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Accepts "0", "false", "no", "off", "" (case-insensitive) as false.
fn parse_bool_env(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

mod daemon;
mod jobs;

#[derive(Parser)]
#[command(name = "gleaner")]
#[command(about = "Scheduled web scraping", long_about = None)]
struct Cli {
    /// Data directory holding `jobs/` and `configs/`
    #[arg(long, global = true, env = "GLEANER_HOME")]
    home: Option<PathBuf>,

    /// Log at debug level when RUST_LOG is unset.
    /// Accepts "1", "true", "yes" or "on".
    #[arg(
        long,
        global = true,
        env = "GLEANER_DEBUG",
        value_parser = parse_bool_env,
        default_value = "false",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, list and control scraping jobs
    Job {
        #[command(subcommand)]
        command: jobs::JobCommand,
    },

    /// Inspect fetch configurations
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Run the scheduler until interrupted
    Scheduler {
        /// Seconds between polls for due jobs
        #[arg(long, env = "GLEANER_CHECK_INTERVAL", default_value = "60")]
        check_interval: u64,

        /// Maximum number of jobs executing at once
        #[arg(long, env = "GLEANER_MAX_CONCURRENT_JOBS", default_value = "4")]
        max_concurrent_jobs: usize,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// List the names of stored configurations
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "gleaner=debug"
    } else {
        "gleaner=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let home = cli.home.unwrap_or_else(JobStore::default_home);

    match cli.command {
        Commands::Job { command } => {
            let manager = open_manager(&home).await?;
            jobs::run(&manager, command).await
        }

        Commands::Config {
            command: ConfigCommand::List,
        } => list_configs(&home).await,

        Commands::Scheduler {
            check_interval,
            max_concurrent_jobs,
        } => {
            let manager = open_manager(&home).await?;
            daemon::run(Arc::new(manager), check_interval, max_concurrent_jobs).await
        }
    }
}

fn configs_dir(home: &Path) -> PathBuf {
    home.join("configs")
}

/// Load every job under `<home>/jobs`, resolving configurations from `<home>/configs`.
async fn open_manager(home: &Path) -> Result<JobManager> {
    let store = JobStore::open(home.join("jobs"))
        .await
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;
    let resolver = Arc::new(DirConfigResolver::new(configs_dir(home)));

    JobManager::open(store, resolver)
        .await
        .map_err(|e| miette::miette!("failed to load jobs: {}", e))
}

async fn list_configs(home: &Path) -> Result<()> {
    let resolver = DirConfigResolver::new(configs_dir(home));
    let names = resolver
        .list()
        .await
        .map_err(|e| miette::miette!("failed to list configurations: {}", e))?;

    if names.is_empty() {
        println!("No configurations found in {}", resolver.dir().display());
        return Ok(());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}
