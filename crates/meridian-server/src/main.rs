//! Meridian Server - replication endpoint
//!
//! ```text
//! meridian-server [--config <path>] [--bind <addr>] [--data-dir <dir>] [--verbose] [--json-logs]
//! ```

use clap::Parser;
use meridian_core::Database;
use meridian_server::{Config, ReplicationServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Meridian Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "meridian-server")]
#[command(about = "Meridian document database replication endpoint", long_about = None)]
struct Args {
    /// TOML configuration file (overrides MERIDIAN_CONFIG)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Listener address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::from_env()?,
    };
    if let Some(addr) = args.bind {
        config = config.with_addr(addr);
    }
    if let Some(data_dir) = &args.data_dir {
        config = config.with_data_dir(data_dir);
    }

    init_tracing(args.verbose, args.json_logs || config.log_json);

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("meridian-worker")
        .enable_all()
        .build()?;
    rt.block_on(async_main(config))
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "meridian_server=debug,meridian_core=debug".into())
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "meridian_server=info,meridian_core=info".into())
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    let database_config = config.database_config()?;
    std::fs::create_dir_all(&database_config.data_dir)?;
    info!("Using data directory: {:?}", database_config.data_dir);

    let database = Arc::new(Database::open(database_config)?);
    info!(
        database = %database.name(),
        node_tag = %database.node_tag(),
        database_id = %database.database_id(),
        "Database ready"
    );

    let server = ReplicationServer::bind(database, config.addr).await?;
    info!("Meridian server listening on {}", server.local_addr()?);

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}
