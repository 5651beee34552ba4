//! # tally-node: RocksDB storage, wallet registry, queries and RPC.
//!
//! Composes the Tally subsystems into a running indexer service:
//! - [`storage::RocksWalletStore`]: persistent wallet views backed by RocksDB
//! - [`registry::WalletRegistry`]: wallet creation and address imports
//! - [`query::QueryService`]: cursor-paged wallet queries
//! - [`rpc`]: JSON-RPC server for external access
//! - [`bitcoind::BitcoindSource`]: chain source over bitcoind JSON-RPC
//! - [`service::Service`]: task wiring and shutdown
//! - [`config::ServiceConfig`]: service configuration

pub mod bitcoind;
pub mod config;
pub mod query;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod storage;

pub use bitcoind::BitcoindSource;
pub use self::config::ServiceConfig;
pub use query::{QueryService, ServiceInfo};
pub use registry::WalletRegistry;
pub use rpc::start_rpc_server;
pub use service::Service;
pub use storage::RocksWalletStore;
