//! SkyVault transfer engine front end.

mod app;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skyvault-transferd")]
#[command(about = "Upload, download and manage SkyVault transfers")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload a local file in chunks, skipping chunks already received
    Upload {
        file: PathBuf,
        /// Stored file name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,
        /// Spool the file and ingest it as a background task instead
        #[arg(long)]
        task: bool,
    },
    /// Download stored content
    Download {
        digest: String,
        size: u64,
        /// Copy the finished bytes to this local path
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Look up stored content by digest and size
    Check { digest: String, size: u64 },
    /// Show one task
    Status { task_id: String },
    /// List tasks, newest first
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        principal: Option<String>,
    },
    /// Task counts and mean progress per state
    Stats {
        #[arg(long)]
        principal: Option<String>,
    },
    /// Start, pause, resume, cancel or delete a task
    Control { task_id: String, action: String },
    /// Delete finished tasks older than the given number of days
    Prune {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Drop idle upload sessions
    Reclaim,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = config::Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.engine.data_dir = dir;
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.engine.data_dir.display(),
        "starting SkyVault transfer engine"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, cli.command))?;
    Ok(())
}
