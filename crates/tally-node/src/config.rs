//! Service configuration for the Tally indexer.
//!
//! Provides [`ServiceConfig`] with defaults for the data directory, RPC
//! binding, the upstream node endpoint and indexing parameters. Values can be
//! layered from an optional TOML file and `TALLY_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use tally_core::constants::{
    DEFAULT_EVENT_BUFFER, DEFAULT_POLL_INTERVAL_MS, DEFAULT_READY_ATTEMPTS,
    DEFAULT_READY_INTERVAL_MS, DEFAULT_SOURCE_RETRY_MS, DEFAULT_STORAGE_BACKOFF_MS,
    DEFAULT_STORAGE_RETRIES, DEFAULT_UNDO_DEPTH, NetworkType,
};
use tally_indexer::IndexerConfig;
use tally_sync::MonitorConfig;

/// Configuration for an indexer service instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Chain the upstream node follows.
    pub network: NetworkType,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the JSON-RPC server. Defaults to the network's port.
    pub rpc_port: Option<u16>,
    /// Upstream node JSON-RPC URL. Defaults to localhost on the network's port.
    pub node_rpc_url: Option<String>,
    pub node_rpc_user: Option<String>,
    pub node_rpc_password: Option<String>,
    /// Blocks for which undo entries are retained.
    pub undo_depth: u64,
    /// First height indexed on an empty store.
    pub start_height: u64,
    /// Node polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Delay before retrying an unreachable node, in milliseconds.
    pub source_retry_ms: u64,
    /// Retries for a failed block write.
    pub storage_retries: u32,
    /// Delay between storage retries in milliseconds.
    pub retry_backoff_ms: u64,
    /// Capacity of the monitor to engine channel.
    pub event_buffer: usize,
    /// Attempts made by a readiness wait.
    pub ready_attempts: u32,
    /// Delay between readiness checks in milliseconds.
    pub ready_interval_ms: u64,
    /// Log level filter string (e.g. "info", "debug", "tally_indexer=trace").
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tally");

        Self {
            data_dir,
            network: NetworkType::Mainnet,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: None,
            node_rpc_url: None,
            node_rpc_user: None,
            node_rpc_password: None,
            undo_depth: DEFAULT_UNDO_DEPTH,
            start_height: 0,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            source_retry_ms: DEFAULT_SOURCE_RETRY_MS,
            storage_retries: DEFAULT_STORAGE_RETRIES,
            retry_backoff_ms: DEFAULT_STORAGE_BACKOFF_MS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            ready_attempts: DEFAULT_READY_ATTEMPTS,
            ready_interval_ms: DEFAULT_READY_INTERVAL_MS,
            log_level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load defaults, then the optional TOML file, then `TALLY_*` environment
    /// variables (e.g. `TALLY_UNDO_DEPTH=144`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("TALLY").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB index directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir
            .join(self.network.data_dir_suffix())
            .join("indexdb")
    }

    /// Port the JSON-RPC server listens on.
    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
            .unwrap_or_else(|| self.network.default_rpc_port())
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port())
    }

    /// Upstream node JSON-RPC URL.
    pub fn node_rpc_url(&self) -> String {
        self.node_rpc_url.clone().unwrap_or_else(|| {
            format!("http://127.0.0.1:{}", self.network.default_node_rpc_port())
        })
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry_interval: Duration::from_millis(self.source_retry_ms),
            start_height: self.start_height,
            history_depth: usize::try_from(self.undo_depth).unwrap_or(usize::MAX),
        }
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            start_height: self.start_height,
            undo_depth: self.undo_depth,
            storage_retries: self.storage_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Delay between readiness checks.
    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }
}
