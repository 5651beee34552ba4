//! Tally indexer service binary.
//!
//! Follows a bitcoind-compatible node over JSON-RPC, indexes wallet activity
//! into RocksDB, and serves wallet queries over its own JSON-RPC server.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use tally_core::constants::NetworkType;
use tally_indexer::wait_until_live;
use tally_node_lib::{BitcoindSource, RocksWalletStore, Service, ServiceConfig};
use tracing::{error, info, warn};

/// Tally wallet indexer.
#[derive(Parser, Debug)]
#[command(
    name = "tally-node",
    version,
    about = "Reorg-safe wallet indexer with RocksDB storage and JSON-RPC server"
)]
struct Args {
    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the index database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// RPC server bind address
    #[arg(long)]
    rpc_bind: Option<String>,

    /// RPC server port
    #[arg(long)]
    rpc_port: Option<u16>,

    /// Upstream node JSON-RPC URL
    #[arg(long)]
    node_url: Option<String>,

    /// Upstream node RPC user
    #[arg(long)]
    node_user: Option<String>,

    /// Upstream node RPC password
    #[arg(long)]
    node_password: Option<String>,

    /// Blocks for which undo entries are retained
    #[arg(long)]
    undo_depth: Option<u64>,

    /// First height to index on an empty database
    #[arg(long)]
    start_height: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Follow a testnet node.
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Follow a regtest node.
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    /// Layer CLI flags over the file and environment configuration.
    fn into_config(self) -> Result<(ServiceConfig, String), String> {
        let mut config =
            ServiceConfig::load(self.config.as_deref()).map_err(|e| e.to_string())?;

        if self.regtest {
            config.network = NetworkType::Regtest;
        } else if self.testnet {
            config.network = NetworkType::Testnet;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(bind) = self.rpc_bind {
            config.rpc_bind = bind;
        }
        if self.rpc_port.is_some() {
            config.rpc_port = self.rpc_port;
        }
        if self.node_url.is_some() {
            config.node_rpc_url = self.node_url;
        }
        if self.node_user.is_some() {
            config.node_rpc_user = self.node_user;
        }
        if self.node_password.is_some() {
            config.node_rpc_password = self.node_password;
        }
        if let Some(depth) = self.undo_depth {
            config.undo_depth = depth;
        }
        if let Some(height) = self.start_height {
            config.start_height = height;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok((config, self.log_format))
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (config, log_format) = match args.into_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            process::exit(2);
        }
    };

    init_logging(&config.log_level, &log_format);

    info!("Tally Indexer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        network = ?config.network,
        data_dir = ?config.data_dir,
        rpc_addr = %config.rpc_addr(),
        node = %config.node_rpc_url(),
        undo_depth = config.undo_depth,
        "configuration loaded"
    );

    let db_path = config.db_path();
    if let Err(e) = std::fs::create_dir_all(&db_path) {
        error!("failed to create data_dir: {}", e);
        process::exit(1);
    }

    let store = match RocksWalletStore::open(&db_path) {
        Ok(store) => Arc::new(RwLock::new(store)),
        Err(e) => {
            error!("failed to open index database: {}", e);
            process::exit(1);
        }
    };

    let source = match BitcoindSource::new(
        &config.node_rpc_url(),
        config.node_rpc_user.as_deref(),
        config.node_rpc_password.as_deref(),
    ) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("failed to create node client: {}", e);
            process::exit(1);
        }
    };

    let mut service = match Service::start(&config, store, Arc::clone(&source)).await {
        Ok(service) => service,
        Err(e) => {
            error!("failed to start indexer: {}", e);
            process::exit(1);
        }
    };

    let poll = Duration::from_millis(config.poll_interval_ms);
    let tip_shutdown = service.shutdown_signal();
    tokio::spawn(async move { source.watch_tip(poll, tip_shutdown).await });

    let status = service.status();
    let (attempts, interval) = (config.ready_attempts, config.ready_interval());
    tokio::spawn(async move {
        match wait_until_live(&status, attempts, interval).await {
            Ok(live) => info!(height = ?live.height, "indexer ready"),
            Err(e) => warn!(error = %e, "indexer still catching up"),
        }
    });

    info!("Tally indexer running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down...");
    };

    let mut exit_code = 0;
    tokio::select! {
        result = service.stopped() => {
            match result {
                Ok(()) => info!("indexer pipeline exited"),
                Err(e) => {
                    error!("indexer halted: {}", e);
                    exit_code = 1;
                }
            }
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    if let Err(e) = service.shutdown().await {
        error!("shutdown error: {}", e);
        exit_code = 1;
    }
    info!("Tally indexer shutdown complete");
    process::exit(exit_code);
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_str));

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
