//! Read-only wallet queries with cursor pagination.
//!
//! Every query takes the store's read lock once, so a result reflects a
//! single point between block commits. Paging options are validated before
//! the store is touched.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use tally_core::error::{TallyError, ValidationError};
use tally_core::store::WalletStore;
use tally_core::types::{Hash256, Page, PageQuery, PageRequest, TxDetail, TxIndexEntry, Utxo, WalletId};
use tally_indexer::{IndexerState, IndexerStatus};
use tally_sync::SyncProgress;

/// Service liveness summary.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub state: IndexerState,
    /// Height of the last applied block.
    pub height: Option<u64>,
    /// Node tip height as last seen by the monitor.
    pub node_height: Option<u64>,
    /// Number of registered wallets.
    pub wallets: u64,
}

/// Wallet views over a shared store.
pub struct QueryService<S: WalletStore> {
    store: Arc<RwLock<S>>,
    status: watch::Receiver<IndexerStatus>,
    progress: watch::Receiver<SyncProgress>,
}

impl<S: WalletStore> QueryService<S> {
    pub fn new(
        store: Arc<RwLock<S>>,
        status: watch::Receiver<IndexerStatus>,
        progress: watch::Receiver<SyncProgress>,
    ) -> Self {
        Self {
            store,
            status,
            progress,
        }
    }

    /// Confirmed balance in satoshis.
    pub fn get_balance(&self, wallet_id: &str) -> Result<i64, TallyError> {
        let wallet = WalletId::new(wallet_id)?;
        let store = self.store.read();
        ensure_wallet(&*store, &wallet)?;
        store.balance(&wallet)
    }

    /// Transaction ids touching the wallet, ascending by `(height, position)`.
    pub fn get_txids(
        &self,
        wallet_id: &str,
        query: &PageQuery,
    ) -> Result<Page<TxIndexEntry>, TallyError> {
        let (wallet, request) = parse(wallet_id, query)?;
        let store = self.store.read();
        ensure_wallet(&*store, &wallet)?;
        store.txids_after(&wallet, &request)
    }

    /// Hydrated transactions for one page of the transaction index.
    pub fn get_transactions(
        &self,
        wallet_id: &str,
        query: &PageQuery,
    ) -> Result<Page<TxDetail>, TallyError> {
        let (wallet, request) = parse(wallet_id, query)?;
        let store = self.store.read();
        ensure_wallet(&*store, &wallet)?;
        let page = store.txids_after(&wallet, &request)?;
        let mut items = Vec::with_capacity(page.items.len());
        for entry in &page.items {
            items.push(hydrate(&*store, &entry.txid)?);
        }
        Ok(Page {
            items,
            end: page.end,
        })
    }

    /// Unspent outputs, ascending by `(height, ordinal)`.
    pub fn get_utxos(&self, wallet_id: &str, query: &PageQuery) -> Result<Page<Utxo>, TallyError> {
        let (wallet, request) = parse(wallet_id, query)?;
        let store = self.store.read();
        ensure_wallet(&*store, &wallet)?;
        store.utxos_after(&wallet, &request)
    }

    pub fn get_info(&self) -> Result<ServiceInfo, TallyError> {
        let status = *self.status.borrow();
        let progress = *self.progress.borrow();
        let wallets = self.store.read().wallet_count()?;
        Ok(ServiceInfo {
            state: status.state,
            height: status.height,
            node_height: progress.node_height,
            wallets,
        })
    }

    /// Current engine status.
    pub fn status(&self) -> watch::Receiver<IndexerStatus> {
        self.status.clone()
    }
}

fn parse(wallet_id: &str, query: &PageQuery) -> Result<(WalletId, PageRequest), TallyError> {
    let wallet = WalletId::new(wallet_id)?;
    let request = query.validate()?;
    Ok((wallet, request))
}

fn ensure_wallet<S: WalletStore + ?Sized>(store: &S, wallet: &WalletId) -> Result<(), TallyError> {
    if store.wallet_exists(wallet)? {
        Ok(())
    } else {
        Err(ValidationError::UnknownWallet(wallet.to_string()).into())
    }
}

fn hydrate<S: WalletStore + ?Sized>(store: &S, txid: &Hash256) -> Result<TxDetail, TallyError> {
    store
        .transaction(txid)?
        .ok_or_else(|| TallyError::Storage(format!("indexed transaction {txid} has no details")))
}
