//! Trait interfaces for the wallet indexer.
//!
//! - [`ChainSource`]: the full node being indexed (tally-node implements
//!   it over bitcoind JSON-RPC; tally-sync ships an in-memory simulator)
//! - [`WalletStore`](crate::store::WalletStore): persistent wallet views

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::SourceError;
use crate::types::{BlockRecord, Hash256};

/// Kind of chain change announced by the node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Connect,
    Disconnect,
}

/// A chain change announced by the node.
///
/// Notifications only wake the sync monitor; it always reconciles against
/// the node's reported chain, so a dropped or duplicated notification never
/// causes a gap.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeNotification {
    pub kind: NotificationKind,
    pub height: u64,
    pub hash: Hash256,
}

/// Read access to a full node's best chain.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Height of the node's best chain tip.
    async fn best_height(&self) -> Result<u64, SourceError>;

    /// Hash of the best-chain block at `height`.
    ///
    /// # Errors
    ///
    /// - [`SourceError::BlockNotFound`] if `height` is above the tip
    async fn block_hash(&self, height: u64) -> Result<Hash256, SourceError>;

    /// Full block by hash, including blocks no longer on the best chain.
    async fn block(&self, hash: &Hash256) -> Result<BlockRecord, SourceError>;

    /// Subscribe to chain change notifications.
    fn subscribe(&self) -> broadcast::Receiver<NodeNotification>;
}
