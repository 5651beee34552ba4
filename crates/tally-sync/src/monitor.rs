//! Chain sync monitor.
//!
//! Reconciles the locally indexed chain against the node's best chain and
//! turns the difference into an ordered stream of [`ChainEvent`]s:
//! disconnects of stale local blocks first (tip downwards), then connects of
//! node blocks from the local tip upwards. Node notifications only trigger a
//! reconciliation pass; the node's reported chain is always the source of
//! truth, so missed or duplicated notifications cannot open a gap.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use tally_core::constants::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_SOURCE_RETRY_MS, DEFAULT_UNDO_DEPTH};
use tally_core::error::{IndexError, SourceError, TallyError};
use tally_core::traits::{ChainSource, NodeNotification};
use tally_core::types::{BlockRecord, BlockRef, Hash256};

/// An ordered chain change for the indexing engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    Connect(BlockRecord),
    Disconnect(BlockRecord),
}

impl ChainEvent {
    pub fn block(&self) -> &BlockRecord {
        match self {
            Self::Connect(block) | Self::Disconnect(block) => block,
        }
    }
}

/// Monitor progress, published on a watch channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncProgress {
    /// Height of the last block emitted, `None` before the start height.
    pub local_height: Option<u64>,
    /// Node tip height as of the last successful request.
    pub node_height: Option<u64>,
    /// Set once, the first time the monitor caught up with the node.
    pub synced: bool,
    /// Local height at the moment the monitor first caught up.
    pub ready_height: Option<u64>,
}

impl SyncProgress {
    /// Whether an engine at `height` has applied everything up to the
    /// first catch-up point.
    pub fn reached_by(&self, height: Option<u64>) -> bool {
        if !self.synced {
            return false;
        }
        match self.ready_height {
            None => true,
            Some(ready) => height.is_some_and(|h| h >= ready),
        }
    }
}

/// Monitor tuning.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Reconciliation interval when no notification arrives.
    pub poll_interval: Duration,
    /// Delay after a failed node request.
    pub retry_interval: Duration,
    /// First height to index on an empty store.
    pub start_height: u64,
    /// Recently emitted blocks kept to name disconnects.
    pub history_depth: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            retry_interval: Duration::from_millis(DEFAULT_SOURCE_RETRY_MS),
            start_height: 0,
            history_depth: DEFAULT_UNDO_DEPTH as usize,
        }
    }
}

/// Why a reconciliation pass ended early.
enum Interrupt {
    Source(SourceError),
    /// Parent linkage broke mid-pass; reconcile again right away.
    Restart,
    /// Event receiver dropped or shutdown requested.
    Stopped,
    Fatal(TallyError),
}

impl From<SourceError> for Interrupt {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

enum Wake {
    Shutdown,
    Notified(Option<Result<NodeNotification, broadcast::error::RecvError>>),
    Poll,
}

/// Producer side of the sync pipeline.
pub struct ChainMonitor<C: ChainSource> {
    source: Arc<C>,
    config: MonitorConfig,
    /// Local tip as `(height, hash)`.
    local: Option<(u64, Hash256)>,
    /// Recently emitted blocks, ascending, ending at the local tip.
    history: VecDeque<BlockRef>,
    events: mpsc::Sender<ChainEvent>,
    progress: watch::Sender<SyncProgress>,
}

impl<C: ChainSource> ChainMonitor<C> {
    /// Create a monitor resuming from `seed`, the most recently applied
    /// blocks in ascending order (empty for a fresh store).
    pub fn new(
        source: Arc<C>,
        config: MonitorConfig,
        seed: Vec<BlockRef>,
        events: mpsc::Sender<ChainEvent>,
    ) -> Self {
        let local = seed.last().map(|b| (b.height, b.hash));
        let mut history: VecDeque<BlockRef> = seed.into();
        while history.len() > config.history_depth {
            history.pop_front();
        }
        let (progress, _) = watch::channel(SyncProgress {
            local_height: local.map(|(h, _)| h),
            ..SyncProgress::default()
        });
        Self {
            source,
            config,
            local,
            history,
            events,
            progress,
        }
    }

    /// Subscribe to progress updates.
    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Run until shutdown, until the event receiver is dropped, or until a
    /// fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TallyError> {
        let mut notifications = Some(self.source.subscribe());
        info!(local_height = ?self.local.map(|(h, _)| h), "chain monitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.reconcile(&shutdown).await {
                Ok(()) => {}
                Err(Interrupt::Restart) => continue,
                Err(Interrupt::Stopped) => break,
                Err(Interrupt::Fatal(e)) => {
                    error!(error = %e, "chain monitor halted");
                    return Err(e);
                }
                Err(Interrupt::Source(e)) => {
                    warn!(error = %e, "node request failed, retrying");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                    continue;
                }
            }

            let wake = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() { Wake::Shutdown } else { Wake::Poll }
                }
                n = next_notification(&mut notifications) => Wake::Notified(n),
                _ = tokio::time::sleep(self.config.poll_interval) => Wake::Poll,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Poll | Wake::Notified(Some(Ok(_))) => {}
                Wake::Notified(Some(Err(broadcast::error::RecvError::Lagged(skipped)))) => {
                    debug!(skipped, "notifications lagged, reconciling");
                }
                Wake::Notified(Some(Err(broadcast::error::RecvError::Closed))) | Wake::Notified(None) => {
                    warn!("notification feed closed, falling back to polling");
                    notifications = None;
                }
            }
        }
        info!("chain monitor stopped");
        Ok(())
    }

    async fn reconcile(&mut self, shutdown: &watch::Receiver<bool>) -> Result<(), Interrupt> {
        let node_height = self.source.best_height().await?;
        self.progress.send_modify(|p| p.node_height = Some(node_height));

        // Unwind local blocks the node no longer has on its best chain.
        while let Some((height, hash)) = self.local {
            if height <= node_height && self.source.block_hash(height).await? == hash {
                break;
            }
            let Some(block) = self.history.pop_back() else {
                return Err(Interrupt::Fatal(
                    IndexError::ReorgDepthExceeded { height, hash: hash.to_string() }.into(),
                ));
            };
            let record = self.disconnect_record(&block).await?;
            debug!(height, %hash, "emitting disconnect");
            self.emit(ChainEvent::Disconnect(record)).await?;
            self.local = (block.height > self.config.start_height)
                .then(|| (block.height - 1, block.parent_hash));
            self.publish_local();
        }

        let mut next = self.local.map_or(self.config.start_height, |(h, _)| h + 1);
        while next <= node_height {
            if *shutdown.borrow() {
                return Err(Interrupt::Stopped);
            }
            let hash = self.source.block_hash(next).await?;
            let record = self.source.block(&hash).await?;
            if record.height != next || record.hash != hash {
                return Err(SourceError::Malformed(format!(
                    "asked for block {hash} at height {next}, got {} at {}",
                    record.hash, record.height
                ))
                .into());
            }
            if let Some((_, tip_hash)) = self.local {
                if record.parent_hash != tip_hash {
                    debug!(height = next, %hash, "parent mismatch, restarting reconciliation");
                    return Err(Interrupt::Restart);
                }
            }
            let block = record.block_ref();
            self.emit(ChainEvent::Connect(record)).await?;
            self.history.push_back(block);
            if self.history.len() > self.config.history_depth {
                self.history.pop_front();
            }
            self.local = Some((block.height, block.hash));
            self.publish_local();
            next += 1;
        }

        self.progress.send_if_modified(|p| {
            if p.synced {
                return false;
            }
            p.synced = true;
            p.ready_height = self.local.map(|(h, _)| h);
            info!(ready_height = ?p.ready_height, "caught up with node");
            true
        });
        Ok(())
    }

    /// Full record of a block being disconnected. Falls back to a header-only
    /// record if the node no longer has the block.
    async fn disconnect_record(&self, block: &BlockRef) -> Result<BlockRecord, Interrupt> {
        match self.source.block(&block.hash).await {
            Ok(record) => Ok(record),
            Err(SourceError::BlockNotFound(_)) => Ok(BlockRecord {
                height: block.height,
                hash: block.hash,
                parent_hash: block.parent_hash,
                transactions: Vec::new(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn emit(&self, event: ChainEvent) -> Result<(), Interrupt> {
        self.events.send(event).await.map_err(|_| Interrupt::Stopped)
    }

    fn publish_local(&self) {
        let local_height = self.local.map(|(h, _)| h);
        self.progress.send_modify(|p| p.local_height = local_height);
    }
}

async fn next_notification(
    notifications: &mut Option<broadcast::Receiver<NodeNotification>>,
) -> Option<Result<NodeNotification, broadcast::error::RecvError>> {
    match notifications {
        Some(rx) => Some(rx.recv().await),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChain;

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(10),
            retry_interval: Duration::from_millis(10),
            start_height: 0,
            history_depth: 16,
        }
    }

    struct Harness {
        chain: Arc<MemoryChain>,
        events: mpsc::Receiver<ChainEvent>,
        progress: watch::Receiver<SyncProgress>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<(), TallyError>>,
    }

    fn start(chain: Arc<MemoryChain>, config: MonitorConfig, seed: Vec<BlockRef>) -> Harness {
        let (tx, events) = mpsc::channel(64);
        let monitor = ChainMonitor::new(chain.clone(), config, seed, tx);
        let progress = monitor.progress();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));
        Harness { chain, events, progress, shutdown, handle }
    }

    async fn next(h: &mut Harness) -> ChainEvent {
        tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("monitor stopped")
    }

    fn connect_height(e: &ChainEvent) -> u64 {
        match e {
            ChainEvent::Connect(b) => b.height,
            ChainEvent::Disconnect(b) => panic!("unexpected disconnect at {}", b.height),
        }
    }

    #[tokio::test]
    async fn initial_sync_connects_in_order_and_becomes_ready() {
        let chain = Arc::new(MemoryChain::new());
        chain.mine_empty(3);
        let mut h = start(chain, fast_config(), Vec::new());
        for expected in 0..=3 {
            assert_eq!(connect_height(&next(&mut h).await), expected);
        }
        let progress = *h
            .progress
            .wait_for(|p| p.synced)
            .await
            .unwrap();
        assert_eq!(progress.ready_height, Some(3));
        assert_eq!(progress.node_height, Some(3));
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn follows_new_blocks_after_catch_up() {
        let chain = Arc::new(MemoryChain::new());
        let mut h = start(chain, fast_config(), Vec::new());
        assert_eq!(connect_height(&next(&mut h).await), 0);
        h.chain.mine_empty(2);
        assert_eq!(connect_height(&next(&mut h).await), 1);
        assert_eq!(connect_height(&next(&mut h).await), 2);
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reorg_emits_disconnects_before_connects() {
        let chain = Arc::new(MemoryChain::new());
        let old = chain.mine_empty(2);
        let mut h = start(chain, fast_config(), Vec::new());
        for _ in 0..3 {
            next(&mut h).await;
        }
        h.progress.wait_for(|p| p.synced).await.unwrap();

        let new = h.chain.reorg(2, vec![Vec::new(), Vec::new(), Vec::new()]);
        match next(&mut h).await {
            ChainEvent::Disconnect(b) => assert_eq!(b.hash, old[1].hash),
            other => panic!("expected disconnect, got {other:?}"),
        }
        match next(&mut h).await {
            ChainEvent::Disconnect(b) => assert_eq!(b.hash, old[0].hash),
            other => panic!("expected disconnect, got {other:?}"),
        }
        for block in &new {
            match next(&mut h).await {
                ChainEvent::Connect(b) => assert_eq!(b.hash, block.hash),
                other => panic!("expected connect, got {other:?}"),
            }
        }
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resumes_from_seed_without_replaying() {
        let chain = Arc::new(MemoryChain::new());
        let blocks = chain.mine_empty(2);
        let seed: Vec<BlockRef> = (0..=2)
            .map(|height| chain.block_at(height).unwrap().block_ref())
            .collect();
        chain.mine_empty(1);
        let mut h = start(chain, fast_config(), seed);
        match next(&mut h).await {
            ChainEvent::Connect(b) => {
                assert_eq!(b.height, 3);
                assert_eq!(b.parent_hash, blocks[1].hash);
            }
            other => panic!("expected connect, got {other:?}"),
        }
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn survives_node_outage_without_skipping() {
        let chain = Arc::new(MemoryChain::new());
        let mut h = start(chain, fast_config(), Vec::new());
        next(&mut h).await;
        h.chain.set_offline(true);
        h.chain.mine_empty(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.chain.set_offline(false);
        for expected in 1..=3 {
            assert_eq!(connect_height(&next(&mut h).await), expected);
        }
        h.shutdown.send(true).unwrap();
        h.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reorg_deeper_than_history_is_fatal() {
        let chain = Arc::new(MemoryChain::new());
        chain.mine_empty(5);
        let config = MonitorConfig { history_depth: 2, ..fast_config() };
        let mut h = start(chain, config, Vec::new());
        for _ in 0..6 {
            next(&mut h).await;
        }
        h.progress.wait_for(|p| p.synced).await.unwrap();
        h.chain.reorg(3, vec![Vec::new(); 4]);
        // Two disconnects are named from history, the third is not.
        next(&mut h).await;
        next(&mut h).await;
        let result = tokio::time::timeout(Duration::from_secs(5), h.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(TallyError::Index(IndexError::ReorgDepthExceeded { height: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn stops_when_receiver_dropped() {
        let chain = Arc::new(MemoryChain::new());
        chain.mine_empty(100);
        let (tx, rx) = mpsc::channel(1);
        let monitor = ChainMonitor::new(chain, fast_config(), Vec::new(), tx);
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(shutdown_rx));
        drop(rx);
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[test]
    fn reached_by_requires_sync() {
        let mut p = SyncProgress::default();
        assert!(!p.reached_by(Some(10)));
        p.synced = true;
        assert!(p.reached_by(None));
        p.ready_height = Some(5);
        assert!(!p.reached_by(Some(4)));
        assert!(p.reached_by(Some(5)));
        assert!(!p.reached_by(None));
    }
}
