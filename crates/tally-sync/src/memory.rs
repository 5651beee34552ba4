//! In-memory full node for tests.
//!
//! [`MemoryChain`] keeps a best chain plus every block it ever mined, so
//! stale blocks stay fetchable by hash after a reorg, the same way bitcoind
//! keeps them on disk. Connects and disconnects are announced on a broadcast
//! channel like a node's block notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use tally_core::error::SourceError;
use tally_core::traits::{ChainSource, NodeNotification, NotificationKind};
use tally_core::types::{BlockRecord, Hash256, TxRecord};

const NOTIFICATION_BUFFER: usize = 256;

struct ChainState {
    /// Best-chain hashes, index = height.
    best: Vec<Hash256>,
    blocks: HashMap<Hash256, BlockRecord>,
    next_nonce: u64,
    offline: bool,
}

impl ChainState {
    fn block_hash(&mut self, height: u64) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xb1;
        bytes[1..9].copy_from_slice(&self.next_nonce.to_be_bytes());
        bytes[9..17].copy_from_slice(&height.to_be_bytes());
        self.next_nonce += 1;
        Hash256(bytes)
    }

    fn tip(&self) -> Option<&BlockRecord> {
        self.best.last().and_then(|hash| self.blocks.get(hash))
    }
}

/// Simulated node with a mutable best chain.
pub struct MemoryChain {
    state: RwLock<ChainState>,
    notifications: broadcast::Sender<NodeNotification>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    /// Create a chain holding only an empty genesis block at height 0.
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let chain = Self {
            state: RwLock::new(ChainState {
                best: Vec::new(),
                blocks: HashMap::new(),
                next_nonce: 0,
                offline: false,
            }),
            notifications,
        };
        chain.mine(Vec::new());
        chain
    }

    /// Height of the best chain tip.
    pub fn height(&self) -> u64 {
        (self.state.read().best.len() as u64).saturating_sub(1)
    }

    /// The best-chain block at `height`.
    pub fn block_at(&self, height: u64) -> Option<BlockRecord> {
        let state = self.state.read();
        let hash = state.best.get(height as usize)?;
        state.blocks.get(hash).cloned()
    }

    /// The best chain tip.
    pub fn tip(&self) -> Option<BlockRecord> {
        self.state.read().tip().cloned()
    }

    /// Mine a block with the given transactions on top of the tip.
    pub fn mine(&self, transactions: Vec<TxRecord>) -> BlockRecord {
        let block = {
            let mut state = self.state.write();
            let height = state.best.len() as u64;
            let parent_hash = state.best.last().copied().unwrap_or(Hash256::ZERO);
            let hash = state.block_hash(height);
            let block = BlockRecord {
                height,
                hash,
                parent_hash,
                transactions,
            };
            state.best.push(hash);
            state.blocks.insert(hash, block.clone());
            block
        };
        self.announce(NotificationKind::Connect, &block);
        block
    }

    /// Mine `count` blocks without transactions.
    pub fn mine_empty(&self, count: usize) -> Vec<BlockRecord> {
        (0..count).map(|_| self.mine(Vec::new())).collect()
    }

    /// Remove the tip from the best chain. The genesis block stays.
    pub fn disconnect_tip(&self) -> Option<BlockRecord> {
        let block = {
            let mut state = self.state.write();
            if state.best.len() <= 1 {
                return None;
            }
            let hash = state.best.pop()?;
            state.blocks.get(&hash).cloned()?
        };
        self.announce(NotificationKind::Disconnect, &block);
        Some(block)
    }

    /// Disconnect `depth` blocks, then mine one block per entry of
    /// `replacement`. Returns the newly mined blocks.
    pub fn reorg(&self, depth: usize, replacement: Vec<Vec<TxRecord>>) -> Vec<BlockRecord> {
        for _ in 0..depth {
            self.disconnect_tip();
        }
        replacement.into_iter().map(|txs| self.mine(txs)).collect()
    }

    /// Make every request fail with [`SourceError::Unavailable`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    fn announce(&self, kind: NotificationKind, block: &BlockRecord) {
        // No subscribers is fine; the monitor also polls.
        let _ = self.notifications.send(NodeNotification {
            kind,
            height: block.height,
            hash: block.hash,
        });
    }

    fn ensure_online(&self) -> Result<(), SourceError> {
        if self.state.read().offline {
            return Err(SourceError::Unavailable("node offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MemoryChain {
    async fn best_height(&self) -> Result<u64, SourceError> {
        self.ensure_online()?;
        Ok(self.height())
    }

    async fn block_hash(&self, height: u64) -> Result<Hash256, SourceError> {
        self.ensure_online()?;
        self.state
            .read()
            .best
            .get(height as usize)
            .copied()
            .ok_or_else(|| SourceError::BlockNotFound(format!("height {height}")))
    }

    async fn block(&self, hash: &Hash256) -> Result<BlockRecord, SourceError> {
        self.ensure_online()?;
        self.state
            .read()
            .blocks
            .get(hash)
            .cloned()
            .ok_or_else(|| SourceError::BlockNotFound(hash.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeNotification> {
        self.notifications.subscribe()
    }
}
