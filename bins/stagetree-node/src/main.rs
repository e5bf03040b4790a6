//! Stagetree daemon.
//!
//! Opens the RocksDB-backed placement engine, serves JSON-RPC and runs the
//! scheduled unlock sweep until Ctrl+C.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use stagetree_node_lib::{start_rpc_server, Node, NodeConfig};
use tracing::{error, info};

/// Stagetree placement daemon.
#[derive(Parser, Debug)]
#[command(
    name = "stagetree-node",
    version,
    about = "Stagetree placement engine with RocksDB storage and JSON-RPC server"
)]
struct Args {
    /// TOML config file. Values are overridden by STAGETREE__* env vars, then by flags.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the ledger database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Reward profile ("flat-two-leg", "ten-leg", "principal-sixty-two" or "custom")
    #[arg(long)]
    profile: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    /// Layer CLI flags over the loaded config.
    fn apply(self, mut config: NodeConfig) -> (NodeConfig, String) {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if let Some(port) = self.rpc_port {
            config.rpc_port = port;
        }
        if let Some(profile) = self.profile {
            config.profile = Some(profile);
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(args.config.as_deref()).context("failed to load config")?;
    let (config, log_format) = args.apply(config);

    init_logging(&config.log_level, &log_format);

    info!("Stagetree Node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("rpc_addr: {}", config.rpc_addr());
    info!("profile: {:?}", config.profile);

    let node = match Node::open(config.clone()) {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {}", e);
            return Err(e).context("failed to start node");
        }
    };
    info!(profile = %node.profile().name, "node initialized");

    let rpc_handle = start_rpc_server(&config.rpc_addr(), node.clone())
        .await
        .context("failed to start RPC server")?;
    info!("RPC server listening on {}", config.rpc_addr());
    info!("Stagetree node running (Ctrl+C to stop)");

    let shutdown_signal = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl+C, shutting down..."),
            Err(e) => error!("failed to listen for Ctrl+C: {}", e),
        }
    };

    tokio::select! {
        _ = node.run() => {
            info!("node scheduler exited");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    rpc_handle.stop().ok();
    info!("RPC server stopped");
    node.flush().context("failed to flush ledger")?;
    info!("Stagetree node shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `format = "json"` emits structured JSON lines; anything else is text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
