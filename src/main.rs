use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filedock::depot::archive;
use filedock::{gateway, Config, FileDepot};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Date-partitioned file depot with an HTTP gateway.
#[derive(Parser, Debug)]
#[command(name = "filedock", version, about)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print per-directory upload counts
    Stats,
    /// Drop records whose backing file is gone
    Cleanup {
        /// Report what would be removed without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Summarize an archive on disk
    Inspect { path: PathBuf },
    /// Unpack an archive, into a temporary directory unless --dest is given
    Extract {
        path: PathBuf,
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.log_level);

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let depot = Arc::new(open_depot(&config)?);
            gateway::run(&config.gateway, depot).await
        }
        Command::Stats => {
            let depot = open_depot(&config)?;
            print_json(&depot.directory_stats())
        }
        Command::Cleanup { dry_run } => {
            let depot = open_depot(&config)?;
            let report = depot.cleanup(dry_run).context("Cleanup failed")?;
            info!(
                before = report.before,
                kept = report.kept,
                removed = report.removed.len(),
                dry_run,
                "cleanup finished"
            );
            print_json(&report)
        }
        Command::Inspect { path } => print_json(&archive::inspect(&path)),
        Command::Extract { path, dest } => {
            let tree = archive::extract(&path, dest.as_deref())
                .with_context(|| format!("Failed to extract {}", path.display()))?;
            print_json(&tree)
        }
    }
}

fn open_depot(config: &Config) -> Result<FileDepot> {
    let root = config.storage_root();
    FileDepot::open(&root, config.depot_options())
        .with_context(|| format!("Failed to open storage root {}", root.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
