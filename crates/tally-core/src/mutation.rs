//! Invertible store mutations and per-block undo data.
//!
//! A connected block is reduced to an ordered list of [`Mutation`]s. Every
//! mutation carries the full record it touches, so its inverse is computed
//! from the mutation alone without reading the store. The [`UndoEntry`] for a
//! block is the inverse of each mutation, in reverse order.

use std::collections::BTreeMap;

use crate::error::IndexError;
use crate::types::{BlockRef, TxDetail, TxIndexEntry, Utxo, WalletId};

/// One primitive, invertible change to the wallet views.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Mutation {
    /// Add an output to the global tracked-output set.
    CreateUtxo(Utxo),
    /// Remove an output from the global tracked-output set.
    SpendUtxo(Utxo),
    /// Add an output to a wallet's UTXO index.
    LinkUtxo { wallet: WalletId, utxo: Utxo },
    /// Remove an output from a wallet's UTXO index.
    UnlinkUtxo { wallet: WalletId, utxo: Utxo },
    /// Add `delta` satoshis (possibly negative) to a wallet's balance.
    AdjustBalance { wallet: WalletId, delta: i64 },
    /// Append a transaction to a wallet's history.
    IndexTx { wallet: WalletId, entry: TxIndexEntry },
    /// Remove a transaction from a wallet's history.
    UnindexTx { wallet: WalletId, entry: TxIndexEntry },
    /// Store a transaction's details.
    PutTx(TxDetail),
    /// Remove a transaction's details.
    DeleteTx(TxDetail),
}

impl Mutation {
    /// The mutation that exactly reverts this one.
    pub fn inverse(&self) -> Mutation {
        match self {
            Self::CreateUtxo(utxo) => Self::SpendUtxo(utxo.clone()),
            Self::SpendUtxo(utxo) => Self::CreateUtxo(utxo.clone()),
            Self::LinkUtxo { wallet, utxo } => Self::UnlinkUtxo {
                wallet: wallet.clone(),
                utxo: utxo.clone(),
            },
            Self::UnlinkUtxo { wallet, utxo } => Self::LinkUtxo {
                wallet: wallet.clone(),
                utxo: utxo.clone(),
            },
            Self::AdjustBalance { wallet, delta } => Self::AdjustBalance {
                wallet: wallet.clone(),
                delta: -*delta,
            },
            Self::IndexTx { wallet, entry } => Self::UnindexTx {
                wallet: wallet.clone(),
                entry: entry.clone(),
            },
            Self::UnindexTx { wallet, entry } => Self::IndexTx {
                wallet: wallet.clone(),
                entry: entry.clone(),
            },
            Self::PutTx(detail) => Self::DeleteTx(detail.clone()),
            Self::DeleteTx(detail) => Self::PutTx(detail.clone()),
        }
    }
}

/// Invert a mutation list: inverse of each mutation, in reverse order.
pub fn invert(mutations: &[Mutation]) -> Vec<Mutation> {
    mutations.iter().rev().map(Mutation::inverse).collect()
}

/// Sum the balance adjustments of a mutation list per wallet.
pub fn balance_deltas(mutations: &[Mutation]) -> Result<BTreeMap<WalletId, i64>, IndexError> {
    let mut deltas: BTreeMap<WalletId, i64> = BTreeMap::new();
    for mutation in mutations {
        if let Mutation::AdjustBalance { wallet, delta } = mutation {
            let sum = deltas.entry(wallet.clone()).or_insert(0);
            *sum = sum
                .checked_add(*delta)
                .ok_or_else(|| IndexError::BalanceOutOfRange(wallet.to_string()))?;
        }
    }
    Ok(deltas)
}

/// Apply a delta to a stored balance. Balances never go negative.
pub fn adjusted_balance(wallet: &WalletId, current: i64, delta: i64) -> Result<i64, IndexError> {
    current
        .checked_add(delta)
        .filter(|balance| *balance >= 0)
        .ok_or_else(|| IndexError::BalanceOutOfRange(wallet.to_string()))
}

/// Everything needed to revert one connected block.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct UndoEntry {
    /// The block this entry reverts. Its parent becomes the tip again.
    pub block: BlockRef,
    /// Inverse mutations, already in application order.
    pub mutations: Vec<Mutation>,
}

/// One block's atomic write: new tip, forward mutations, undo entry and
/// undo pruning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCommit {
    pub block: BlockRef,
    pub mutations: Vec<Mutation>,
    pub undo: UndoEntry,
    /// Undo entries for heights below this are deleted in the same write.
    pub prune_below: Option<u64>,
}

impl BlockCommit {
    /// Build the commit for `block`, retaining undo entries for the most
    /// recent `undo_depth` blocks.
    pub fn new(block: BlockRef, mutations: Vec<Mutation>, undo_depth: u64) -> Self {
        let undo = UndoEntry {
            block,
            mutations: invert(&mutations),
        };
        let prune_below = (block.height + 1)
            .checked_sub(undo_depth)
            .filter(|height| *height > 0);
        Self {
            block,
            mutations,
            undo,
            prune_below,
        }
    }
}
