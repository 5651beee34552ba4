//! Indexing engine.
//!
//! Single sequential consumer of the monitor's event stream. Each connect or
//! disconnect becomes exactly one atomic store write made under the store's
//! write lock, so concurrent readers only ever see whole blocks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tally_core::constants::{DEFAULT_STORAGE_BACKOFF_MS, DEFAULT_STORAGE_RETRIES, DEFAULT_UNDO_DEPTH};
use tally_core::error::{IndexError, TallyError};
use tally_core::mutation::BlockCommit;
use tally_core::store::{check_extends, check_is_tip, WalletStore};
use tally_core::types::{BlockRecord, Hash256};
use tally_sync::{ChainEvent, SyncProgress};

use crate::changeset::build_changeset;

/// Engine lifecycle state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexerState {
    /// Catching up with the node.
    Syncing,
    /// Caught up; views reflect the node's chain.
    Live,
    /// Unwinding blocks after a reorg.
    Rewinding,
    /// Stopped by a fatal error.
    Halted,
}

/// Engine state and position, published on a watch channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexerStatus {
    pub state: IndexerState,
    /// Height of the last applied block.
    pub height: Option<u64>,
    pub tip: Option<Hash256>,
}

/// Engine tuning.
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    /// First height indexed on an empty store.
    pub start_height: u64,
    /// Undo entries retained for the most recent blocks.
    pub undo_depth: u64,
    /// Retries for a block whose store write fails.
    pub storage_retries: u32,
    /// Fixed delay between storage retries.
    pub retry_backoff: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            undo_depth: DEFAULT_UNDO_DEPTH,
            storage_retries: DEFAULT_STORAGE_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_STORAGE_BACKOFF_MS),
        }
    }
}

/// Consumer side of the sync pipeline.
pub struct Indexer<S: WalletStore> {
    store: Arc<RwLock<S>>,
    config: IndexerConfig,
    progress: watch::Receiver<SyncProgress>,
    status: watch::Sender<IndexerStatus>,
}

impl<S: WalletStore> Indexer<S> {
    /// Create an engine positioned at the store's current tip.
    pub fn new(
        store: Arc<RwLock<S>>,
        config: IndexerConfig,
        progress: watch::Receiver<SyncProgress>,
    ) -> Result<Self, TallyError> {
        let tip = store.read().tip()?;
        let (status, _) = watch::channel(IndexerStatus {
            state: IndexerState::Syncing,
            height: tip.map(|t| t.height),
            tip: tip.map(|t| t.hash),
        });
        Ok(Self {
            store,
            config,
            progress,
            status,
        })
    }

    /// Subscribe to status updates.
    pub fn status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.subscribe()
    }

    /// Current status.
    pub fn current(&self) -> IndexerStatus {
        *self.status.borrow()
    }

    /// Apply one block on top of the tip.
    ///
    /// # Errors
    ///
    /// - [`IndexError::DuplicateBlock`] if the block is already applied
    /// - [`IndexError::OutOfOrder`] if it does not extend the tip
    pub fn connect(&mut self, block: &BlockRecord) -> Result<(), TallyError> {
        let block_ref = block.block_ref();
        let mutations = {
            let mut store = self.store.write();
            if store
                .block_at(block.height)?
                .is_some_and(|applied| applied.hash == block.hash)
            {
                return Err(duplicate(block));
            }
            match store.tip()? {
                Some(tip) => check_extends(Some(&tip), &block_ref)?,
                None if block.height != self.config.start_height => {
                    return Err(IndexError::OutOfOrder {
                        height: block.height,
                        hash: block.hash.to_string(),
                        tip_height: None,
                    }
                    .into());
                }
                None => {}
            }
            let mutations = build_changeset(&*store, block)?;
            let commit = BlockCommit::new(block_ref, mutations, self.config.undo_depth);
            store.connect_block(&commit)?;
            commit.mutations.len()
        };

        let progress = *self.progress.borrow();
        self.status.send_modify(|s| {
            s.height = Some(block.height);
            s.tip = Some(block.hash);
            s.state = match s.state {
                IndexerState::Syncing | IndexerState::Rewinding if progress.reached_by(s.height) => {
                    IndexerState::Live
                }
                IndexerState::Rewinding => IndexerState::Syncing,
                state => state,
            };
        });
        let state = self.current().state;
        if state == IndexerState::Live {
            info!(height = block.height, hash = %block.hash, txs = block.transactions.len(), mutations, "connected block");
        } else {
            debug!(height = block.height, hash = %block.hash, mutations, "connected block");
        }
        Ok(())
    }

    /// Revert the tip block.
    ///
    /// # Errors
    ///
    /// - [`IndexError::DuplicateBlock`] if the block is not applied
    /// - [`IndexError::OutOfOrder`] if it is applied but not the tip
    /// - [`IndexError::ReorgDepthExceeded`] if its undo entry was pruned
    pub fn disconnect(&mut self, block: &BlockRecord) -> Result<(), TallyError> {
        let parent = {
            let mut store = self.store.write();
            if !store
                .block_at(block.height)?
                .is_some_and(|applied| applied.hash == block.hash)
            {
                return Err(duplicate(block));
            }
            check_is_tip(store.tip()?.as_ref(), &block.block_ref())?;
            let undo = store.undo_entry(block.height, &block.hash)?.ok_or_else(|| {
                IndexError::ReorgDepthExceeded {
                    height: block.height,
                    hash: block.hash.to_string(),
                }
            })?;
            self.status.send_if_modified(|s| {
                let changed = s.state != IndexerState::Rewinding;
                s.state = IndexerState::Rewinding;
                changed
            });
            store.disconnect_block(&undo)?;
            store.tip()?
        };
        self.status.send_modify(|s| {
            s.height = parent.map(|p| p.height);
            s.tip = parent.map(|p| p.hash);
        });
        info!(height = block.height, hash = %block.hash, "disconnected block");
        Ok(())
    }

    /// Apply one event, retrying storage failures with a fixed backoff.
    /// Duplicate deliveries are logged and ignored.
    pub async fn handle(&mut self, event: &ChainEvent) -> Result<(), TallyError> {
        let mut attempt = 0;
        loop {
            let result = match event {
                ChainEvent::Connect(block) => self.connect(block),
                ChainEvent::Disconnect(block) => self.disconnect(block),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_duplicate() => {
                    debug!(error = %e, "ignoring duplicate event");
                    return Ok(());
                }
                Err(e) if e.is_storage() && attempt < self.config.storage_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, "store write failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-evaluate the state after a monitor progress change or a
    /// disconnect. `Syncing` goes live once the first catch-up point is
    /// applied. `Rewinding` ends once the engine is back at the monitor's
    /// position with no connect pending, and only goes live if the first
    /// catch-up point is still covered.
    fn refresh(&mut self) {
        let progress = *self.progress.borrow_and_update();
        self.status.send_if_modified(|s| {
            let next = match s.state {
                IndexerState::Syncing if progress.reached_by(s.height) => IndexerState::Live,
                IndexerState::Rewinding if progress.local_height == s.height => {
                    if progress.reached_by(s.height) {
                        IndexerState::Live
                    } else {
                        IndexerState::Syncing
                    }
                }
                state => state,
            };
            if next == s.state {
                return false;
            }
            if next == IndexerState::Live {
                info!(height = ?s.height, "indexer live");
            }
            s.state = next;
            true
        });
    }

    /// Consume events until shutdown, until the stream ends, or until a
    /// fatal error. Shutdown is only observed between blocks.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TallyError> {
        info!(height = ?self.current().height, "indexer started");
        let mut progress_open = true;
        self.refresh();
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                changed = self.progress.changed(), if progress_open => {
                    if changed.is_err() {
                        progress_open = false;
                    }
                    None
                }
                event = events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
            };
            match next {
                Some(event) => {
                    if let Err(e) = self.handle(&event).await {
                        error!(error = %e, height = event.block().height, "indexer halted");
                        self.status.send_modify(|s| s.state = IndexerState::Halted);
                        return Err(e);
                    }
                    if matches!(event, ChainEvent::Disconnect(_)) {
                        self.refresh();
                    }
                }
                None => self.refresh(),
            }
        }
        info!(height = ?self.current().height, "indexer stopped");
        Ok(())
    }
}

fn duplicate(block: &BlockRecord) -> TallyError {
    IndexError::DuplicateBlock {
        height: block.height,
        hash: block.hash.to_string(),
    }
    .into()
}

/// Wait for the engine to go live, checking `attempts` times with a fixed
/// `interval` between checks.
///
/// # Errors
///
/// - [`IndexError::NotReady`] if the engine is not live after every attempt
///   or has halted
pub async fn wait_until_live(
    status: &watch::Receiver<IndexerStatus>,
    attempts: u32,
    interval: Duration,
) -> Result<IndexerStatus, TallyError> {
    for attempt in 1..=attempts {
        let current = *status.borrow();
        match current.state {
            IndexerState::Live => return Ok(current),
            IndexerState::Halted => return Err(IndexError::NotReady { attempts: attempt }.into()),
            _ => {}
        }
        debug!(attempt, state = ?current.state, "indexer not live yet");
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(IndexError::NotReady { attempts }.into())
}
