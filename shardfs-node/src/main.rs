//! shardfs Storage Node Daemon
//!
//! Runs a storage node that:
//! - Stores objects locally in a content-addressed directory tree
//! - Keeps TCP links to its bootstrap peers and accepts new ones
//! - Replicates, serves and deletes objects on behalf of other nodes

use clap::Parser;
use shardfs_node::{FileServer, FileServerOpts, NodeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardfs-node")]
#[command(about = "shardfs storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Storage directory (overrides config file)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:3000 (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Comma separated peers to dial on startup (overrides config file)
    #[arg(short, long, value_delimiter = ',')]
    bootstrap: Option<Vec<String>>,

    /// Node id (overrides config file)
    #[arg(long)]
    node_id: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    info!("shardfs node starting...");

    // Priority: CLI args > environment > config.toml > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.node_id, cli.data_dir, cli.listen, cli.bootstrap);

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        return Err(e.into());
    }

    if config.security.encryption_key.is_none() {
        info!("No encryption key configured; generated one for this run only");
    }

    info!(
        node_id = %config.node.id,
        listen_addr = %config.network.listen_addr,
        data_dir = ?config.storage.data_dir,
        bootstrap = ?config.network.bootstrap_peers,
        "Configuration loaded"
    );

    let server = Arc::new(FileServer::new(FileServerOpts::from_config(&config)?));
    let addr = server.bind().await?;

    info!("========================================");
    info!("  shardfs Node Running");
    info!("========================================");
    info!("  Node ID:     {}", server.node_id());
    info!("  Listening:   {}", addr);
    info!("  Data dir:    {:?}", config.storage.data_dir);
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    let event_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    shutdown_signal().await?;
    info!("Received shutdown signal");

    server.stop();
    match event_loop.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "File server error"),
        Err(e) => error!(error = %e, "File server task failed"),
    }

    info!("shardfs node stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
