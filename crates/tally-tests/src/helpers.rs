//! Shared test helpers for scenario and property tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use tally_core::constants::COIN;
use tally_core::mutation::BlockCommit;
use tally_core::store::{MemoryWalletStore, WalletStore};
use tally_core::types::{
    Address, BlockRecord, Hash256, OutPoint, PageQuery, TxInput, TxOutput, TxRecord, Utxo,
    WalletId,
};
use tally_indexer::changeset::build_changeset;
use tally_indexer::{IndexerState, IndexerStatus};
use tally_node_lib::{QueryService, Service, ServiceConfig};
use tally_sync::memory::MemoryChain;

/// Whole coins in satoshis.
pub const fn coins(n: i64) -> i64 {
    n * COIN
}

pub fn wallet(name: &str) -> WalletId {
    WalletId::new(name).unwrap()
}

pub fn addr(name: &str) -> Address {
    Address::new(name).unwrap()
}

/// Deterministic transaction id from a sequence number.
pub fn txid(n: u64) -> Hash256 {
    let mut bytes = [0x7a; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    Hash256(bytes)
}

/// Create a transaction spending `spends` and paying each `(address, satoshis)`
/// pair in order.
pub fn payment(txid: Hash256, spends: &[OutPoint], outputs: &[(&str, i64)]) -> TxRecord {
    TxRecord {
        txid,
        inputs: spends
            .iter()
            .map(|op| TxInput { previous_output: *op })
            .collect(),
        outputs: outputs
            .iter()
            .zip(0u32..)
            .map(|((a, satoshis), index)| TxOutput {
                index,
                address: Some(addr(a)),
                satoshis: *satoshis,
            })
            .collect(),
    }
}

/// Service settings tuned for fast tests: ephemeral RPC port, short poll and
/// retry intervals.
pub fn fast_config() -> ServiceConfig {
    ServiceConfig {
        rpc_port: Some(0),
        poll_interval_ms: 10,
        source_retry_ms: 10,
        retry_backoff_ms: 1,
        ready_interval_ms: 10,
        ready_attempts: 500,
        ..ServiceConfig::default()
    }
}

/// The views a wallet owner sees: history, balance and spendable outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overview {
    pub txids: Vec<Hash256>,
    pub balance: i64,
    pub utxos: Vec<Utxo>,
}

/// Read the complete overview of `wallet`, following page cursors.
pub fn overview<S: WalletStore>(query: &QueryService<S>, wallet: &str) -> Overview {
    let mut txids = Vec::new();
    let mut q = PageQuery { limit: Some(1000), ..PageQuery::default() };
    loop {
        let page = query.get_txids(wallet, &q).unwrap();
        txids.extend(page.items.iter().map(|e| e.txid));
        match page.end {
            Some(end) => q = PageQuery::after(end, Some(1000)),
            None => break,
        }
    }
    let mut utxos = Vec::new();
    let mut q = PageQuery { limit: Some(1000), ..PageQuery::default() };
    loop {
        let page = query.get_utxos(wallet, &q).unwrap();
        utxos.extend(page.items);
        match page.end {
            Some(end) => q = PageQuery::after(end, Some(1000)),
            None => break,
        }
    }
    Overview {
        txids,
        balance: query.get_balance(wallet).unwrap(),
        utxos,
    }
}

/// A running service following a simulated node.
pub struct Harness {
    pub chain: Arc<MemoryChain>,
    pub store: Arc<RwLock<MemoryWalletStore>>,
    pub service: Service<MemoryWalletStore>,
    next_txid: AtomicU64,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(fast_config(), Arc::new(MemoryChain::new())).await
    }

    pub async fn start_with(config: ServiceConfig, chain: Arc<MemoryChain>) -> Self {
        let store = Arc::new(RwLock::new(MemoryWalletStore::new()));
        let service = Service::start(&config, Arc::clone(&store), Arc::clone(&chain))
            .await
            .unwrap();
        Self {
            chain,
            store,
            service,
            next_txid: AtomicU64::new(1),
        }
    }

    /// A fresh transaction id.
    pub fn fresh_txid(&self) -> Hash256 {
        txid(self.next_txid.fetch_add(1, Ordering::Relaxed))
    }

    /// Wait until the engine is live at the node's current tip.
    pub async fn synced(&self) -> IndexerStatus {
        let target = self.chain.tip().map(|b| b.hash);
        let mut status = self.service.status();
        let wait = status.wait_for(|s| s.state == IndexerState::Live && s.tip == target);
        match tokio::time::timeout(Duration::from_secs(10), wait).await {
            Ok(Ok(current)) => *current,
            Ok(Err(_)) => panic!("indexer stopped"),
            Err(_) => {
                let current = *self.service.status().borrow();
                panic!("timed out waiting for indexer at {target:?}, status {current:?}")
            }
        }
    }

    /// Mine a block and wait for it to be indexed.
    pub async fn mine(&self, transactions: Vec<TxRecord>) -> BlockRecord {
        let block = self.chain.mine(transactions);
        self.synced().await;
        block
    }

    pub fn query(&self) -> QueryService<MemoryWalletStore> {
        self.service.query()
    }

    pub fn overview(&self, wallet: &str) -> Overview {
        overview(&self.service.query(), wallet)
    }

    pub async fn stop(self) {
        self.service.shutdown().await.unwrap();
    }
}

/// Apply `block` directly to a store, bypassing the pipeline.
pub fn apply_block<S: WalletStore>(store: &mut S, block: &BlockRecord, undo_depth: u64) {
    let mutations = build_changeset(&*store, block).unwrap();
    store
        .connect_block(&BlockCommit::new(block.block_ref(), mutations, undo_depth))
        .unwrap();
}

/// Revert the tip `block` of a store using its undo entry.
pub fn revert_block<S: WalletStore>(store: &mut S, block: &BlockRecord) {
    let undo = store
        .undo_entry(block.height, &block.hash)
        .unwrap()
        .unwrap();
    store.disconnect_block(&undo).unwrap();
}
