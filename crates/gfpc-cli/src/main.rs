use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gfpc_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gfpc")]
#[command(about = "Gluten-free price catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print the run summary as JSON.
    Sync,
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Summarize the most recent run reports as markdown.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Print the canonical key for a product name.
    Key { name: String },
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = gfpc_sync::run_sync_once_from_env().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs, reports_dir } => {
            let reports_dir = reports_dir.unwrap_or_else(|| SyncConfig::from_env().reports_dir);
            println!("{}", gfpc_sync::report_daily_markdown(runs, &reports_dir)?);
        }
        Commands::Key { name } => {
            println!("{}", gfpc_core::canonical_key(&name));
        }
    }

    Ok(())
}
