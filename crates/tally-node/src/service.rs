//! Service composition.
//!
//! The [`Service`] struct wires the store, the chain monitor, the indexing
//! engine and the JSON-RPC server together. The monitor and engine run as
//! separate tasks joined by a bounded channel; a shared watch channel tells
//! both to stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jsonrpsee::server::ServerHandle;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tally_core::error::TallyError;
use tally_core::store::WalletStore;
use tally_core::traits::ChainSource;
use tally_indexer::{wait_until_live, Indexer, IndexerStatus};
use tally_sync::{ChainMonitor, SyncProgress};

use crate::config::ServiceConfig;
use crate::query::QueryService;
use crate::registry::WalletRegistry;
use crate::rpc::start_rpc_server;

/// A running indexer service.
pub struct Service<S: WalletStore> {
    store: Arc<RwLock<S>>,
    status: watch::Receiver<IndexerStatus>,
    progress: watch::Receiver<SyncProgress>,
    shutdown: watch::Sender<bool>,
    monitor: Option<JoinHandle<Result<(), TallyError>>>,
    indexer: Option<JoinHandle<Result<(), TallyError>>>,
    rpc: ServerHandle,
    rpc_addr: SocketAddr,
}

impl<S: WalletStore + 'static> Service<S> {
    /// Resume indexing from the store's tip and start serving RPC.
    pub async fn start<C: ChainSource + 'static>(
        config: &ServiceConfig,
        store: Arc<RwLock<S>>,
        source: Arc<C>,
    ) -> Result<Self, TallyError> {
        let monitor_config = config.monitor_config();
        let seed = store.read().recent_blocks(monitor_config.history_depth)?;
        let resume = seed.last().copied();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let monitor = ChainMonitor::new(source, monitor_config, seed, events_tx);
        let progress = monitor.progress();
        let indexer = Indexer::new(Arc::clone(&store), config.indexer_config(), progress.clone())?;
        let status = indexer.status();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let registry = WalletRegistry::new(Arc::clone(&store));
        let query = QueryService::new(Arc::clone(&store), status.clone(), progress.clone());
        let (rpc, rpc_addr) = start_rpc_server(&config.rpc_addr(), registry, query).await?;
        info!(%rpc_addr, "RPC server listening");

        let monitor = tokio::spawn(monitor.run(shutdown_rx.clone()));
        let indexer = tokio::spawn(indexer.run(events_rx, shutdown_rx));
        info!(
            height = ?resume.map(|b| b.height),
            tip = ?resume.map(|b| b.hash.to_string()),
            "indexer service started"
        );

        Ok(Self {
            store,
            status,
            progress,
            shutdown,
            monitor: Some(monitor),
            indexer: Some(indexer),
            rpc,
            rpc_addr,
        })
    }

    /// Address the RPC server is bound to.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn registry(&self) -> WalletRegistry<S> {
        WalletRegistry::new(Arc::clone(&self.store))
    }

    pub fn query(&self) -> QueryService<S> {
        QueryService::new(Arc::clone(&self.store), self.status.clone(), self.progress.clone())
    }

    /// Subscribe to engine status updates.
    pub fn status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.clone()
    }

    /// Subscribe to the shutdown signal, for auxiliary tasks such as a tip
    /// poller.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Wait for the engine to catch up with the node.
    pub async fn wait_until_live(
        &self,
        attempts: u32,
        interval: Duration,
    ) -> Result<IndexerStatus, TallyError> {
        wait_until_live(&self.status, attempts, interval).await
    }

    /// Resolve when either pipeline task ends, returning its outcome. A task
    /// that ends on its own (not through [`Service::shutdown`]) has either
    /// lost its peer or hit a fatal error.
    pub async fn stopped(&mut self) -> Result<(), TallyError> {
        let (Some(monitor), Some(indexer)) = (self.monitor.as_mut(), self.indexer.as_mut()) else {
            return Ok(());
        };
        // The monitor's outcome wins when both have ended; the engine only
        // stops on its own once the monitor is gone.
        let (name, joined) = tokio::select! {
            biased;
            joined = monitor => ("monitor", joined),
            joined = indexer => ("indexer", joined),
        };
        if name == "monitor" {
            self.monitor = None;
        } else {
            self.indexer = None;
        }
        flatten(name, joined)
    }

    /// Signal both tasks, wait for them, flush the store, then stop the RPC
    /// server. The engine finishes the block in hand before exiting.
    pub async fn shutdown(mut self) -> Result<(), TallyError> {
        info!("shutting down indexer service");
        let _ = self.shutdown.send(true);
        let mut result = Ok(());
        for (name, task) in [("monitor", self.monitor.take()), ("indexer", self.indexer.take())] {
            if let Some(task) = task {
                if let Err(e) = flatten(name, task.await) {
                    warn!(task = name, error = %e, "task ended with error");
                    result = Err(e);
                }
            }
        }
        if let Err(e) = self.store.read().flush() {
            warn!(error = %e, "failed to flush index store");
            result = result.and(Err(e));
        }
        if self.rpc.stop().is_ok() {
            self.rpc.clone().stopped().await;
        }
        info!("indexer service stopped");
        result
    }
}

fn flatten(
    name: &str,
    joined: Result<Result<(), TallyError>, tokio::task::JoinError>,
) -> Result<(), TallyError> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(TallyError::Internal(format!("{name} task failed: {e}"))),
    }
}
