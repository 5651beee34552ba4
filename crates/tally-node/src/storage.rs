//! RocksDB-backed persistent wallet store.
//!
//! Implements [`WalletStore`] using RocksDB column families for wallet
//! membership, the per-wallet views, the tracked-output set, the indexed
//! chain and its undo entries. Every block connect or disconnect is a single
//! [`WriteBatch`], so a crash leaves either the old or the new state.
//!
//! Keys are built so that byte order equals logical order: variable-length
//! strings carry a one-byte length prefix and integers are big-endian.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use tally_core::error::{TallyError, ValidationError};
use tally_core::mutation::{BlockCommit, Mutation, UndoEntry};
use tally_core::store::{check_extends, check_is_tip, resolve_balances, WalletStore};
use tally_core::types::{
    Address, BlockRef, Cursor, Hash256, OutPoint, Page, PageRequest, TxDetail, TxIndexEntry, Utxo,
    WalletId,
};

// --- Column family names ---

const CF_WALLETS: &str = "wallets";
const CF_WALLET_ADDRESSES: &str = "wallet_addresses";
const CF_ADDRESS_WALLETS: &str = "address_wallets";
const CF_TX_INDEX: &str = "tx_index";
const CF_WALLET_UTXOS: &str = "wallet_utxos";
const CF_UTXOS: &str = "utxos";
const CF_BALANCES: &str = "balances";
const CF_TRANSACTIONS: &str = "transactions";
const CF_CHAIN: &str = "chain";
const CF_UNDO: &str = "undo";
const CF_METADATA: &str = "metadata";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_WALLETS,
    CF_WALLET_ADDRESSES,
    CF_ADDRESS_WALLETS,
    CF_TX_INDEX,
    CF_WALLET_UTXOS,
    CF_UTXOS,
    CF_BALANCES,
    CF_TRANSACTIONS,
    CF_CHAIN,
    CF_UNDO,
    CF_METADATA,
];

// --- Metadata keys ---

const META_TIP: &[u8] = b"tip";
const META_WALLET_COUNT: &[u8] = b"wallet_count";

/// RocksDB-backed wallet store.
pub struct RocksWalletStore {
    db: DB,
}

impl RocksWalletStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all column families if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TallyError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| TallyError::Storage(e.to_string()))?;
        Ok(Self { db })
    }

    // --- Internal helpers ---

    /// Get a column family handle.
    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, TallyError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TallyError::Storage(format!("missing column family: {name}")))
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, TallyError> {
        let cf = self.cf_handle(cf)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| TallyError::Storage(e.to_string()))
    }

    fn get_decoded<T: bincode::Decode<()>>(
        &self,
        cf: &str,
        key: &[u8],
    ) -> Result<Option<T>, TallyError> {
        self.get(cf, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    /// Iterate a column family forward from `start` while keys keep `prefix`.
    fn scan_prefix(
        &self,
        cf: &str,
        prefix: &[u8],
        start: &[u8],
    ) -> Result<impl Iterator<Item = Result<(Box<[u8]>, Box<[u8]>), TallyError>> + '_, TallyError>
    {
        let cf = self.cf_handle(cf)?;
        let prefix = prefix.to_vec();
        Ok(self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward))
            .map(|item| item.map_err(|e| TallyError::Storage(e.to_string())))
            .take_while(move |item| match item {
                Ok((key, _)) => key.starts_with(&prefix),
                Err(_) => true,
            }))
    }

    /// Wallet-prefixed scan strictly after the request cursor, up to
    /// `limit + 1` rows.
    fn scan_page(
        &self,
        cf: &str,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, TallyError> {
        let prefix = string_key(wallet.as_str());
        let start = match request.after {
            Some(cursor) => cursor_key(wallet, cursor),
            None => prefix.clone(),
        };
        let mut rows = Vec::with_capacity(request.limit + 1);
        for item in self.scan_prefix(cf, &prefix, &start)? {
            let (key, value) = item?;
            if request.after.is_some() && *key == *start {
                continue;
            }
            rows.push((key, value));
            if rows.len() > request.limit {
                break;
            }
        }
        Ok(rows)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), TallyError> {
        self.db
            .write(batch)
            .map_err(|e| TallyError::Storage(e.to_string()))
    }

    /// Stage a mutation list and its resolved balances into `batch`.
    fn stage_mutations(
        &self,
        batch: &mut WriteBatch,
        mutations: &[Mutation],
    ) -> Result<(), TallyError> {
        let balances = resolve_balances(self, mutations)?;

        let cf_utxos = self.cf_handle(CF_UTXOS)?;
        let cf_wallet_utxos = self.cf_handle(CF_WALLET_UTXOS)?;
        let cf_tx_index = self.cf_handle(CF_TX_INDEX)?;
        let cf_transactions = self.cf_handle(CF_TRANSACTIONS)?;
        let cf_balances = self.cf_handle(CF_BALANCES)?;

        for mutation in mutations {
            match mutation {
                Mutation::CreateUtxo(utxo) => {
                    batch.put_cf(cf_utxos, outpoint_key(&utxo.outpoint), encode(utxo)?);
                }
                Mutation::SpendUtxo(utxo) => {
                    batch.delete_cf(cf_utxos, outpoint_key(&utxo.outpoint));
                }
                Mutation::LinkUtxo { wallet, utxo } => {
                    batch.put_cf(cf_wallet_utxos, cursor_key(wallet, utxo.cursor()), encode(utxo)?);
                }
                Mutation::UnlinkUtxo { wallet, utxo } => {
                    batch.delete_cf(cf_wallet_utxos, cursor_key(wallet, utxo.cursor()));
                }
                Mutation::IndexTx { wallet, entry } => {
                    batch.put_cf(cf_tx_index, cursor_key(wallet, entry.cursor()), entry.txid.as_bytes());
                }
                Mutation::UnindexTx { wallet, entry } => {
                    batch.delete_cf(cf_tx_index, cursor_key(wallet, entry.cursor()));
                }
                Mutation::PutTx(detail) => {
                    batch.put_cf(cf_transactions, detail.txid.as_bytes(), encode(detail)?);
                }
                Mutation::DeleteTx(detail) => {
                    batch.delete_cf(cf_transactions, detail.txid.as_bytes());
                }
                Mutation::AdjustBalance { .. } => {}
            }
        }

        for (wallet, balance) in balances {
            if balance == 0 {
                batch.delete_cf(cf_balances, wallet.as_str().as_bytes());
            } else {
                batch.put_cf(cf_balances, wallet.as_str().as_bytes(), balance.to_be_bytes());
            }
        }
        Ok(())
    }
}

// --- Key encoding ---

/// Length-prefixed string: `len(u8) || bytes`.
fn string_key(s: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + s.len());
    key.push(s.len() as u8);
    key.extend_from_slice(s.as_bytes());
    key
}

/// `wallet || height(BE) || index(BE)`.
fn cursor_key(wallet: &WalletId, cursor: Cursor) -> Vec<u8> {
    let mut key = string_key(wallet.as_str());
    key.extend_from_slice(&cursor.height.to_be_bytes());
    key.extend_from_slice(&cursor.index.to_be_bytes());
    key
}

/// `prefix || member` for the membership column families.
fn member_key(owner: &str, member: &str) -> Vec<u8> {
    let mut key = string_key(owner);
    key.extend_from_slice(member.as_bytes());
    key
}

/// `txid || index(BE)`.
fn outpoint_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[0..32].copy_from_slice(outpoint.txid.as_bytes());
    key[32..36].copy_from_slice(&outpoint.index.to_be_bytes());
    key
}

/// Encode a height as big-endian bytes for ordered iteration.
fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

/// `height(BE) || hash`.
fn undo_key(height: u64, hash: &Hash256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[0..8].copy_from_slice(&height.to_be_bytes());
    key[8..40].copy_from_slice(hash.as_bytes());
    key
}

fn cursor_from_key(key: &[u8]) -> Result<Cursor, TallyError> {
    let n = key.len();
    if n < 12 {
        return Err(TallyError::Storage("invalid index key length".into()));
    }
    let mut height = [0u8; 8];
    height.copy_from_slice(&key[n - 12..n - 4]);
    let mut index = [0u8; 4];
    index.copy_from_slice(&key[n - 4..]);
    Ok(Cursor {
        height: u64::from_be_bytes(height),
        index: u32::from_be_bytes(index),
    })
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, TallyError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| TallyError::Storage(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, TallyError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| TallyError::Storage(e.to_string()))?;
    Ok(value)
}

fn decode_u64(bytes: &[u8]) -> Result<u64, TallyError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| TallyError::Storage("invalid u64 value length".into()))?;
    Ok(u64::from_be_bytes(arr))
}

impl WalletStore for RocksWalletStore {
    fn create_wallet(&mut self, wallet: &WalletId, created_at: u64) -> Result<(), TallyError> {
        let key = wallet.as_str().as_bytes();
        if self.get(CF_WALLETS, key)?.is_some() {
            return Err(ValidationError::AlreadyExists(wallet.to_string()).into());
        }
        let count = self.wallet_count()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_WALLETS)?, key, created_at.to_be_bytes());
        batch.put_cf(
            self.cf_handle(CF_METADATA)?,
            META_WALLET_COUNT,
            (count + 1).to_be_bytes(),
        );
        self.write(batch)
    }

    fn wallet_exists(&self, wallet: &WalletId) -> Result<bool, TallyError> {
        Ok(self.get(CF_WALLETS, wallet.as_str().as_bytes())?.is_some())
    }

    fn wallet_count(&self) -> Result<u64, TallyError> {
        match self.get(CF_METADATA, META_WALLET_COUNT)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn import_address(&mut self, wallet: &WalletId, address: &Address) -> Result<bool, TallyError> {
        if !self.wallet_exists(wallet)? {
            return Err(ValidationError::UnknownWallet(wallet.to_string()).into());
        }
        let forward = member_key(wallet.as_str(), address.as_str());
        if self.get(CF_WALLET_ADDRESSES, &forward)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf_handle(CF_WALLET_ADDRESSES)?, &forward, b"");
        batch.put_cf(
            self.cf_handle(CF_ADDRESS_WALLETS)?,
            member_key(address.as_str(), wallet.as_str()),
            b"",
        );
        self.write(batch)?;
        Ok(true)
    }

    fn wallet_addresses(&self, wallet: &WalletId) -> Result<Vec<Address>, TallyError> {
        let prefix = string_key(wallet.as_str());
        let mut addresses = Vec::new();
        for item in self.scan_prefix(CF_WALLET_ADDRESSES, &prefix, &prefix)? {
            let (key, _) = item?;
            let member = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| TallyError::Storage(e.to_string()))?;
            addresses.push(Address::new(member).map_err(|e| TallyError::Storage(e.to_string()))?);
        }
        Ok(addresses)
    }

    fn address_wallets(&self, address: &Address) -> Result<Vec<WalletId>, TallyError> {
        let prefix = string_key(address.as_str());
        let mut wallets = Vec::new();
        for item in self.scan_prefix(CF_ADDRESS_WALLETS, &prefix, &prefix)? {
            let (key, _) = item?;
            let member = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| TallyError::Storage(e.to_string()))?;
            wallets.push(WalletId::new(member).map_err(|e| TallyError::Storage(e.to_string()))?);
        }
        Ok(wallets)
    }

    fn tip(&self) -> Result<Option<BlockRef>, TallyError> {
        self.get_decoded(CF_METADATA, META_TIP)
    }

    fn block_at(&self, height: u64) -> Result<Option<BlockRef>, TallyError> {
        self.get_decoded(CF_CHAIN, &height_key(height))
    }

    fn recent_blocks(&self, count: usize) -> Result<Vec<BlockRef>, TallyError> {
        let cf = self.cf_handle(CF_CHAIN)?;
        let mut blocks = Vec::with_capacity(count);
        for item in self.db.iterator_cf(cf, IteratorMode::End).take(count) {
            let (_, value) = item.map_err(|e| TallyError::Storage(e.to_string()))?;
            blocks.push(decode(&value)?);
        }
        blocks.reverse();
        Ok(blocks)
    }

    fn undo_entry(&self, height: u64, hash: &Hash256) -> Result<Option<UndoEntry>, TallyError> {
        self.get_decoded(CF_UNDO, &undo_key(height, hash))
    }

    fn undo_count(&self) -> Result<usize, TallyError> {
        let cf = self.cf_handle(CF_UNDO)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(|e| TallyError::Storage(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    fn connect_block(&mut self, commit: &BlockCommit) -> Result<(), TallyError> {
        let block = &commit.block;
        check_extends(self.tip()?.as_ref(), block)?;

        let mut batch = WriteBatch::default();
        self.stage_mutations(&mut batch, &commit.mutations)?;

        let block_bytes = encode(block)?;
        batch.put_cf(self.cf_handle(CF_CHAIN)?, height_key(block.height), &block_bytes);
        batch.put_cf(self.cf_handle(CF_METADATA)?, META_TIP, &block_bytes);

        let cf_undo = self.cf_handle(CF_UNDO)?;
        batch.put_cf(cf_undo, undo_key(block.height, &block.hash), encode(&commit.undo)?);
        if let Some(below) = commit.prune_below {
            batch.delete_range_cf(cf_undo, height_key(0), height_key(below));
        }

        // Write atomically.
        self.write(batch)
    }

    fn disconnect_block(&mut self, undo: &UndoEntry) -> Result<(), TallyError> {
        let block = &undo.block;
        check_is_tip(self.tip()?.as_ref(), block)?;

        let mut batch = WriteBatch::default();
        self.stage_mutations(&mut batch, &undo.mutations)?;

        batch.delete_cf(self.cf_handle(CF_CHAIN)?, height_key(block.height));
        batch.delete_cf(self.cf_handle(CF_UNDO)?, undo_key(block.height, &block.hash));

        let cf_meta = self.cf_handle(CF_METADATA)?;
        let parent = match block.height.checked_sub(1) {
            Some(height) => self.block_at(height)?,
            None => None,
        };
        match parent {
            Some(parent) => batch.put_cf(cf_meta, META_TIP, encode(&parent)?),
            None => batch.delete_cf(cf_meta, META_TIP),
        }

        // Write atomically.
        self.write(batch)
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, TallyError> {
        self.get_decoded(CF_UTXOS, &outpoint_key(outpoint))
    }

    fn wallet_utxo_linked(&self, wallet: &WalletId, utxo: &Utxo) -> Result<bool, TallyError> {
        Ok(self
            .get(CF_WALLET_UTXOS, &cursor_key(wallet, utxo.cursor()))?
            .is_some())
    }

    fn balance(&self, wallet: &WalletId) -> Result<i64, TallyError> {
        match self.get(CF_BALANCES, wallet.as_str().as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| TallyError::Storage("invalid balance length".into()))?;
                Ok(i64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    fn txids_after(
        &self,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Page<TxIndexEntry>, TallyError> {
        let mut scanned = Vec::new();
        for (key, value) in self.scan_page(CF_TX_INDEX, wallet, request)? {
            let cursor = cursor_from_key(&key)?;
            let txid: [u8; 32] = value[..]
                .try_into()
                .map_err(|_| TallyError::Storage("invalid txid length".into()))?;
            scanned.push(TxIndexEntry {
                txid: Hash256(txid),
                height: cursor.height,
                position: cursor.index,
            });
        }
        Ok(Page::from_scan(scanned, request.limit, TxIndexEntry::cursor))
    }

    fn utxos_after(
        &self,
        wallet: &WalletId,
        request: &PageRequest,
    ) -> Result<Page<Utxo>, TallyError> {
        let scanned = self
            .scan_page(CF_WALLET_UTXOS, wallet, request)?
            .into_iter()
            .map(|(_, value)| decode::<Utxo>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page::from_scan(scanned, request.limit, Utxo::cursor))
    }

    fn transaction(&self, txid: &Hash256) -> Result<Option<TxDetail>, TallyError> {
        self.get_decoded(CF_TRANSACTIONS, txid.as_bytes())
    }

    fn flush(&self) -> Result<(), TallyError> {
        for name in ALL_CFS {
            self.db
                .flush_cf(self.cf_handle(name)?)
                .map_err(|e| TallyError::Storage(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_keys_sort_numerically() {
        let w = WalletId::new("w").unwrap();
        let a = cursor_key(&w, Cursor { height: 255, index: 9 });
        let b = cursor_key(&w, Cursor { height: 256, index: 0 });
        let c = cursor_key(&w, Cursor { height: 256, index: 1 });
        assert!(a < b && b < c);
        assert_eq!(cursor_from_key(&c).unwrap(), Cursor { height: 256, index: 1 });
    }

    #[test]
    fn wallet_prefixes_do_not_collide() {
        // "ab" must not be a prefix match for wallet "a" followed by "b...".
        let a = string_key("a");
        let ab = string_key("ab");
        assert!(!ab.starts_with(&a));
    }

    #[test]
    fn undo_keys_order_by_height() {
        let low = undo_key(1, &Hash256([0xFF; 32]));
        let high = undo_key(2, &Hash256::ZERO);
        assert!(low < high);
        assert!(low.as_slice() < height_key(2).as_slice());
    }
}
