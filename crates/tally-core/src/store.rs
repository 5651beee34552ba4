//! Wallet store interface and in-memory implementation.
//!
//! Provides the [`WalletStore`] trait for wallet membership, the per-wallet
//! views (balance, transaction index, UTXO index), the indexed chain and its
//! undo entries. The [`MemoryWalletStore`] is suitable for testing; the
//! service uses RocksDB (tally-node).
//!
//! Commits passed to [`WalletStore::connect_block`] must already be ordered by
//! the indexing engine. The store only performs minimal sanity checks (tip
//! linkage, non-negative balances).

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use crate::error::{IndexError, TallyError, ValidationError};
use crate::mutation::{adjusted_balance, balance_deltas, BlockCommit, Mutation, UndoEntry};
use crate::types::{
    Address, BlockRef, Cursor, Hash256, OutPoint, Page, PageRequest, TxDetail, TxIndexEntry, Utxo,
    WalletId,
};

/// Persistent state behind the registry, the indexing engine and the query
/// service.
///
/// Writes take `&mut self`; callers share the store behind an `RwLock` so a
/// block commit is one write-locked call and readers observe either the
/// pre-block or the post-block state.
pub trait WalletStore: Send + Sync {
    /// Register a new wallet.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::AlreadyExists`] if the wallet is already registered
    fn create_wallet(&mut self, wallet: &WalletId, created_at: u64) -> Result<(), TallyError>;

    /// Whether a wallet is registered.
    fn wallet_exists(&self, wallet: &WalletId) -> Result<bool, TallyError>;

    /// Number of registered wallets.
    fn wallet_count(&self) -> Result<u64, TallyError>;

    /// Link an address to a wallet. Returns `false` if it was already linked.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::UnknownWallet`] if the wallet is not registered
    fn import_address(&mut self, wallet: &WalletId, address: &Address) -> Result<bool, TallyError>;

    /// Addresses linked to a wallet, in lexicographic order.
    fn wallet_addresses(&self, wallet: &WalletId) -> Result<Vec<Address>, TallyError>;

    /// Wallets an address is linked to, in lexicographic order.
    fn address_wallets(&self, address: &Address) -> Result<Vec<WalletId>, TallyError>;

    /// The last applied block, or `None` on an empty store.
    fn tip(&self) -> Result<Option<BlockRef>, TallyError>;

    /// The applied block at `height`, if any.
    fn block_at(&self, height: u64) -> Result<Option<BlockRef>, TallyError>;

    /// Up to `count` most recently applied blocks, ascending by height.
    fn recent_blocks(&self, count: usize) -> Result<Vec<BlockRef>, TallyError>;

    /// The undo entry of an applied block, if still retained.
    fn undo_entry(&self, height: u64, hash: &Hash256) -> Result<Option<UndoEntry>, TallyError>;

    /// Number of retained undo entries.
    fn undo_count(&self) -> Result<usize, TallyError>;

    /// Apply a block's mutations, store its undo entry, advance the tip and
    /// prune old undo entries, all in one atomic write.
    ///
    /// # Errors
    ///
    /// - [`IndexError::OutOfOrder`] if the block does not extend the tip
    /// - [`IndexError::BalanceOutOfRange`] if a balance would leave `0..=i64::MAX`
    fn connect_block(&mut self, commit: &BlockCommit) -> Result<(), TallyError>;

    /// Apply an undo entry, delete it and move the tip to the block's parent,
    /// all in one atomic write.
    ///
    /// # Errors
    ///
    /// - [`IndexError::OutOfOrder`] if the entry's block is not the tip
    fn disconnect_block(&mut self, undo: &UndoEntry) -> Result<(), TallyError>;

    /// Look up a tracked output by outpoint. `None` if spent or never tracked.
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, TallyError>;

    /// Whether a tracked output is in a wallet's UTXO index.
    fn wallet_utxo_linked(&self, wallet: &WalletId, utxo: &Utxo) -> Result<bool, TallyError>;

    /// Confirmed balance of a wallet in satoshis. Unknown wallets read as 0.
    fn balance(&self, wallet: &WalletId) -> Result<i64, TallyError>;

    /// Transaction index entries strictly after the request cursor.
    fn txids_after(
        &self,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Page<TxIndexEntry>, TallyError>;

    /// Unspent outputs strictly after the request cursor.
    fn utxos_after(&self, wallet: &WalletId, request: &PageRequest)
        -> Result<Page<Utxo>, TallyError>;

    /// Stored details of a transaction.
    fn transaction(&self, txid: &Hash256) -> Result<Option<TxDetail>, TallyError>;

    /// Persist buffered writes. Called once the writers have stopped.
    fn flush(&self) -> Result<(), TallyError>;
}

/// Resolve the balances a mutation list leaves behind, one per adjusted
/// wallet. Fails before anything is written if a balance would leave range.
pub fn resolve_balances<S: WalletStore + ?Sized>(
    store: &S,
    mutations: &[Mutation],
) -> Result<Vec<(WalletId, i64)>, TallyError> {
    let mut resolved = Vec::new();
    for (wallet, delta) in balance_deltas(mutations)? {
        let current = store.balance(&wallet)?;
        let next = adjusted_balance(&wallet, current, delta)?;
        resolved.push((wallet, next));
    }
    Ok(resolved)
}

/// Check that `block` directly extends `tip`.
pub fn check_extends(tip: Option<&BlockRef>, block: &BlockRef) -> Result<(), IndexError> {
    match tip {
        Some(tip) if block.height != tip.height + 1 || block.parent_hash != tip.hash => {
            Err(IndexError::OutOfOrder {
                height: block.height,
                hash: block.hash.to_string(),
                tip_height: Some(tip.height),
            })
        }
        _ => Ok(()),
    }
}

/// Check that `block` is the current tip.
pub fn check_is_tip(tip: Option<&BlockRef>, block: &BlockRef) -> Result<(), IndexError> {
    if tip.map(|t| t.hash) == Some(block.hash) {
        Ok(())
    } else {
        Err(IndexError::OutOfOrder {
            height: block.height,
            hash: block.hash.to_string(),
            tip_height: tip.map(|t| t.height),
        })
    }
}

/// In-memory wallet store for testing.
///
/// Stores everything in `BTreeMap`s with no persistence. Two stores compare
/// equal exactly when every view is identical.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryWalletStore {
    /// Wallet → creation time (Unix seconds).
    wallets: BTreeMap<WalletId, u64>,
    wallet_addresses: BTreeMap<WalletId, BTreeSet<Address>>,
    address_wallets: BTreeMap<Address, BTreeSet<WalletId>>,
    /// (wallet, height, position) → txid.
    tx_index: BTreeMap<(WalletId, Cursor), Hash256>,
    /// (wallet, height, ordinal) → output.
    wallet_utxos: BTreeMap<(WalletId, Cursor), Utxo>,
    /// Global tracked-output set.
    utxos: BTreeMap<OutPoint, Utxo>,
    /// Non-zero balances only.
    balances: BTreeMap<WalletId, i64>,
    transactions: BTreeMap<Hash256, TxDetail>,
    /// Applied chain, height → block.
    chain: BTreeMap<u64, BlockRef>,
    undo: BTreeMap<(u64, Hash256), UndoEntry>,
}

impl MemoryWalletStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, mutations: &[Mutation]) -> Result<(), TallyError> {
        let balances = resolve_balances(self, mutations)?;
        for mutation in mutations {
            match mutation {
                Mutation::CreateUtxo(utxo) => {
                    self.utxos.insert(utxo.outpoint, utxo.clone());
                }
                Mutation::SpendUtxo(utxo) => {
                    self.utxos.remove(&utxo.outpoint);
                }
                Mutation::LinkUtxo { wallet, utxo } => {
                    self.wallet_utxos
                        .insert((wallet.clone(), utxo.cursor()), utxo.clone());
                }
                Mutation::UnlinkUtxo { wallet, utxo } => {
                    self.wallet_utxos.remove(&(wallet.clone(), utxo.cursor()));
                }
                Mutation::IndexTx { wallet, entry } => {
                    self.tx_index
                        .insert((wallet.clone(), entry.cursor()), entry.txid);
                }
                Mutation::UnindexTx { wallet, entry } => {
                    self.tx_index.remove(&(wallet.clone(), entry.cursor()));
                }
                Mutation::PutTx(detail) => {
                    self.transactions.insert(detail.txid, detail.clone());
                }
                Mutation::DeleteTx(detail) => {
                    self.transactions.remove(&detail.txid);
                }
                Mutation::AdjustBalance { .. } => {}
            }
        }
        for (wallet, balance) in balances {
            if balance == 0 {
                self.balances.remove(&wallet);
            } else {
                self.balances.insert(wallet, balance);
            }
        }
        Ok(())
    }
}

/// Collect up to `limit + 1` values of a wallet-prefixed map strictly after
/// the request cursor.
fn scan_after<'a, V>(
    map: &'a BTreeMap<(WalletId, Cursor), V>,
    wallet: &WalletId,
    request: &PageRequest,
) -> impl Iterator<Item = (&'a Cursor, &'a V)> {
    let start = match request.after {
        Some(cursor) => Bound::Excluded((wallet.clone(), cursor)),
        None => Bound::Included((wallet.clone(), Cursor { height: 0, index: 0 })),
    };
    let wallet = wallet.clone();
    map.range((start, Bound::Unbounded))
        .take_while(move |((w, _), _)| *w == wallet)
        .map(|((_, cursor), value)| (cursor, value))
        .take(request.limit + 1)
}

impl WalletStore for MemoryWalletStore {
    fn create_wallet(&mut self, wallet: &WalletId, created_at: u64) -> Result<(), TallyError> {
        if self.wallets.contains_key(wallet) {
            return Err(ValidationError::AlreadyExists(wallet.to_string()).into());
        }
        self.wallets.insert(wallet.clone(), created_at);
        Ok(())
    }

    fn wallet_exists(&self, wallet: &WalletId) -> Result<bool, TallyError> {
        Ok(self.wallets.contains_key(wallet))
    }

    fn wallet_count(&self) -> Result<u64, TallyError> {
        Ok(self.wallets.len() as u64)
    }

    fn import_address(&mut self, wallet: &WalletId, address: &Address) -> Result<bool, TallyError> {
        if !self.wallets.contains_key(wallet) {
            return Err(ValidationError::UnknownWallet(wallet.to_string()).into());
        }
        let added = self
            .wallet_addresses
            .entry(wallet.clone())
            .or_default()
            .insert(address.clone());
        self.address_wallets
            .entry(address.clone())
            .or_default()
            .insert(wallet.clone());
        Ok(added)
    }

    fn wallet_addresses(&self, wallet: &WalletId) -> Result<Vec<Address>, TallyError> {
        Ok(self
            .wallet_addresses
            .get(wallet)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn address_wallets(&self, address: &Address) -> Result<Vec<WalletId>, TallyError> {
        Ok(self
            .address_wallets
            .get(address)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn tip(&self) -> Result<Option<BlockRef>, TallyError> {
        Ok(self.chain.values().next_back().copied())
    }

    fn block_at(&self, height: u64) -> Result<Option<BlockRef>, TallyError> {
        Ok(self.chain.get(&height).copied())
    }

    fn recent_blocks(&self, count: usize) -> Result<Vec<BlockRef>, TallyError> {
        let mut blocks: Vec<BlockRef> = self.chain.values().rev().take(count).copied().collect();
        blocks.reverse();
        Ok(blocks)
    }

    fn undo_entry(&self, height: u64, hash: &Hash256) -> Result<Option<UndoEntry>, TallyError> {
        Ok(self.undo.get(&(height, *hash)).cloned())
    }

    fn undo_count(&self) -> Result<usize, TallyError> {
        Ok(self.undo.len())
    }

    fn connect_block(&mut self, commit: &BlockCommit) -> Result<(), TallyError> {
        check_extends(self.chain.values().next_back(), &commit.block)?;
        self.apply(&commit.mutations)?;
        self.chain.insert(commit.block.height, commit.block);
        self.undo
            .insert((commit.block.height, commit.block.hash), commit.undo.clone());
        if let Some(below) = commit.prune_below {
            self.undo = self.undo.split_off(&(below, Hash256::ZERO));
        }
        Ok(())
    }

    fn disconnect_block(&mut self, undo: &UndoEntry) -> Result<(), TallyError> {
        check_is_tip(self.chain.values().next_back(), &undo.block)?;
        self.apply(&undo.mutations)?;
        self.chain.remove(&undo.block.height);
        self.undo.remove(&(undo.block.height, undo.block.hash));
        Ok(())
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, TallyError> {
        Ok(self.utxos.get(outpoint).cloned())
    }

    fn wallet_utxo_linked(&self, wallet: &WalletId, utxo: &Utxo) -> Result<bool, TallyError> {
        Ok(self.wallet_utxos.contains_key(&(wallet.clone(), utxo.cursor())))
    }

    fn balance(&self, wallet: &WalletId) -> Result<i64, TallyError> {
        Ok(self.balances.get(wallet).copied().unwrap_or(0))
    }

    fn txids_after(
        &self,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Page<TxIndexEntry>, TallyError> {
        let scanned = scan_after(&self.tx_index, wallet, request)
            .map(|(cursor, txid)| TxIndexEntry {
                txid: *txid,
                height: cursor.height,
                position: cursor.index,
            })
            .collect();
        Ok(Page::from_scan(scanned, request.limit, TxIndexEntry::cursor))
    }

    fn utxos_after(
        &self,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Page<Utxo>, TallyError> {
        let scanned = scan_after(&self.wallet_utxos, wallet, request)
            .map(|(_, utxo)| utxo.clone())
            .collect();
        Ok(Page::from_scan(scanned, request.limit, Utxo::cursor))
    }

    fn transaction(&self, txid: &Hash256) -> Result<Option<TxDetail>, TallyError> {
        Ok(self.transactions.get(txid).cloned())
    }

    fn flush(&self) -> Result<(), TallyError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};

    fn wallet(name: &str) -> WalletId {
        WalletId::new(name).unwrap()
    }

    fn addr(name: &str) -> Address {
        Address::new(name).unwrap()
    }

    fn block(height: u64) -> BlockRef {
        BlockRef {
            height,
            hash: Hash256([height as u8 + 1; 32]),
            parent_hash: Hash256([height as u8; 32]),
        }
    }

    fn utxo(height: u64, ordinal: u32, satoshis: i64) -> Utxo {
        Utxo {
            outpoint: OutPoint { txid: Hash256([ordinal as u8 + 100; 32]), index: 0 },
            address: addr("a1"),
            satoshis,
            height,
            ordinal,
        }
    }

    fn receive(w: &WalletId, u: &Utxo) -> Vec<Mutation> {
        vec![
            Mutation::CreateUtxo(u.clone()),
            Mutation::LinkUtxo { wallet: w.clone(), utxo: u.clone() },
            Mutation::IndexTx {
                wallet: w.clone(),
                entry: TxIndexEntry { txid: u.outpoint.txid, height: u.height, position: u.ordinal },
            },
            Mutation::PutTx(TxDetail {
                txid: u.outpoint.txid,
                block_hash: block(u.height).hash,
                height: u.height,
                position: u.ordinal,
                inputs: vec![TxInput { previous_output: OutPoint { txid: Hash256::ZERO, index: 0 } }],
                outputs: vec![TxOutput { index: 0, address: Some(u.address.clone()), satoshis: u.satoshis }],
            }),
            Mutation::AdjustBalance { wallet: w.clone(), delta: u.satoshis },
        ]
    }

    #[test]
    fn create_wallet_rejects_duplicates() {
        let mut store = MemoryWalletStore::new();
        store.create_wallet(&wallet("w1"), 0).unwrap();
        let err = store.create_wallet(&wallet("w1"), 1).unwrap_err();
        assert!(matches!(err, TallyError::Validation(ValidationError::AlreadyExists(_))));
        assert_eq!(store.wallet_count().unwrap(), 1);
    }

    #[test]
    fn import_address_is_idempotent() {
        let mut store = MemoryWalletStore::new();
        let w = wallet("w1");
        store.create_wallet(&w, 0).unwrap();
        assert!(store.import_address(&w, &addr("a1")).unwrap());
        assert!(!store.import_address(&w, &addr("a1")).unwrap());
        assert_eq!(store.wallet_addresses(&w).unwrap(), vec![addr("a1")]);
        assert_eq!(store.address_wallets(&addr("a1")).unwrap(), vec![w]);
    }

    #[test]
    fn import_into_unknown_wallet_fails() {
        let mut store = MemoryWalletStore::new();
        let err = store.import_address(&wallet("nope"), &addr("a1")).unwrap_err();
        assert!(matches!(err, TallyError::Validation(ValidationError::UnknownWallet(_))));
    }

    #[test]
    fn connect_then_disconnect_restores_state() {
        let mut store = MemoryWalletStore::new();
        let w = wallet("w1");
        store.create_wallet(&w, 0).unwrap();
        store.import_address(&w, &addr("a1")).unwrap();
        let before = store.clone();

        let u = utxo(1, 0, 5_000);
        let commit = BlockCommit::new(block(1), receive(&w, &u), 288);
        store.connect_block(&commit).unwrap();
        assert_eq!(store.balance(&w).unwrap(), 5_000);
        assert_eq!(store.tip().unwrap(), Some(block(1)));
        assert_eq!(store.utxo(&u.outpoint).unwrap(), Some(u.clone()));
        assert!(store.wallet_utxo_linked(&w, &u).unwrap());

        let undo = store.undo_entry(1, &block(1).hash).unwrap().unwrap();
        store.disconnect_block(&undo).unwrap();
        assert_eq!(store, before);
    }

    #[test]
    fn connect_rejects_non_extending_block() {
        let mut store = MemoryWalletStore::new();
        store.connect_block(&BlockCommit::new(block(1), vec![], 288)).unwrap();
        let err = store
            .connect_block(&BlockCommit::new(block(3), vec![], 288))
            .unwrap_err();
        assert!(matches!(err, TallyError::Index(IndexError::OutOfOrder { .. })));
    }

    #[test]
    fn disconnect_requires_tip() {
        let mut store = MemoryWalletStore::new();
        store.connect_block(&BlockCommit::new(block(1), vec![], 288)).unwrap();
        store.connect_block(&BlockCommit::new(block(2), vec![], 288)).unwrap();
        let undo = store.undo_entry(1, &block(1).hash).unwrap().unwrap();
        assert!(store.disconnect_block(&undo).is_err());
    }

    #[test]
    fn negative_balance_leaves_store_untouched() {
        let mut store = MemoryWalletStore::new();
        let w = wallet("w1");
        store.create_wallet(&w, 0).unwrap();
        let before = store.clone();
        let bad = vec![
            Mutation::CreateUtxo(utxo(1, 0, 1)),
            Mutation::AdjustBalance { wallet: w, delta: -1 },
        ];
        let err = store.connect_block(&BlockCommit::new(block(1), bad, 288)).unwrap_err();
        assert!(matches!(err, TallyError::Index(IndexError::BalanceOutOfRange(_))));
        assert_eq!(store, before);
    }

    #[test]
    fn undo_entries_are_pruned_to_depth() {
        let mut store = MemoryWalletStore::new();
        for height in 1..=10 {
            store.connect_block(&BlockCommit::new(block(height), vec![], 3)).unwrap();
        }
        assert_eq!(store.undo_count().unwrap(), 3);
        assert!(store.undo_entry(7, &block(7).hash).unwrap().is_none());
        assert!(store.undo_entry(8, &block(8).hash).unwrap().is_some());
    }

    #[test]
    fn recent_blocks_ascend() {
        let mut store = MemoryWalletStore::new();
        for height in 1..=5 {
            store.connect_block(&BlockCommit::new(block(height), vec![], 288)).unwrap();
        }
        let recent = store.recent_blocks(2).unwrap();
        assert_eq!(recent, vec![block(4), block(5)]);
    }

    #[test]
    fn pages_are_gap_free_and_exclusive() {
        let mut store = MemoryWalletStore::new();
        let w = wallet("w1");
        let other = wallet("w2");
        store.create_wallet(&w, 0).unwrap();
        store.create_wallet(&other, 0).unwrap();
        for height in 1..=5u64 {
            let mut ms = receive(&w, &utxo(height, 0, 10));
            ms.extend(receive(&other, &utxo(height, 1, 10)));
            store.connect_block(&BlockCommit::new(block(height), ms, 288)).unwrap();
        }

        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store.utxos_after(&w, &PageRequest { after, limit: 2 }).unwrap();
            seen.extend(page.items.iter().map(|u| u.height));
            match page.end {
                Some(end) => after = Some(end),
                None => break,
            }
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        let page = store
            .txids_after(&w, &PageRequest { after: Some(Cursor { height: 4, index: 0 }), limit: 10 })
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].height, 5);
        assert_eq!(page.end, None);
    }
}
