//! Reduce a block to the mutations it causes on the wallet views.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tally_core::error::{IndexError, TallyError};
use tally_core::mutation::Mutation;
use tally_core::store::WalletStore;
use tally_core::types::{
    Address, BlockRecord, OutPoint, TxDetail, TxIndexEntry, Utxo, WalletId,
};

/// Build the ordered mutation list for `block` against the current store.
///
/// Per transaction, in block order: spends of tracked outputs (outputs
/// created earlier in the same block first, then the store), then outputs
/// paying tracked addresses, then one history entry per touched wallet and
/// the transaction's details. Balance changes are aggregated per wallet and
/// appended last. Inputs and outputs that touch no wallet are ignored.
pub fn build_changeset<S: WalletStore + ?Sized>(
    store: &S,
    block: &BlockRecord,
) -> Result<Vec<Mutation>, TallyError> {
    let mut mutations = Vec::new();
    let mut deltas: BTreeMap<WalletId, i64> = BTreeMap::new();
    let mut pending: HashMap<OutPoint, (Utxo, Vec<WalletId>)> = HashMap::new();
    let mut address_wallets: HashMap<Address, Vec<WalletId>> = HashMap::new();
    let mut ordinal: u32 = 0;

    for (tx, position) in block.transactions.iter().zip(0u32..) {
        let mut touched: BTreeSet<WalletId> = BTreeSet::new();

        for input in &tx.inputs {
            let outpoint = input.previous_output;
            let (utxo, wallets) = match pending.remove(&outpoint) {
                Some(created) => created,
                None => match store.utxo(&outpoint)? {
                    Some(utxo) => {
                        let mut wallets = Vec::new();
                        for wallet in store.address_wallets(&utxo.address)? {
                            if store.wallet_utxo_linked(&wallet, &utxo)? {
                                wallets.push(wallet);
                            }
                        }
                        (utxo, wallets)
                    }
                    None => continue,
                },
            };
            for wallet in &wallets {
                credit(&mut deltas, wallet, -utxo.satoshis)?;
                mutations.push(Mutation::UnlinkUtxo {
                    wallet: wallet.clone(),
                    utxo: utxo.clone(),
                });
                touched.insert(wallet.clone());
            }
            mutations.push(Mutation::SpendUtxo(utxo));
        }

        for output in &tx.outputs {
            let output_ordinal = ordinal;
            ordinal += 1;
            let Some(address) = &output.address else {
                continue;
            };
            if !address_wallets.contains_key(address) {
                address_wallets.insert(address.clone(), store.address_wallets(address)?);
            }
            let wallets = match address_wallets.get(address) {
                Some(wallets) if !wallets.is_empty() => wallets.clone(),
                _ => continue,
            };
            let utxo = Utxo {
                outpoint: OutPoint {
                    txid: tx.txid,
                    index: output.index,
                },
                address: address.clone(),
                satoshis: output.satoshis,
                height: block.height,
                ordinal: output_ordinal,
            };
            mutations.push(Mutation::CreateUtxo(utxo.clone()));
            for wallet in &wallets {
                credit(&mut deltas, wallet, utxo.satoshis)?;
                mutations.push(Mutation::LinkUtxo {
                    wallet: wallet.clone(),
                    utxo: utxo.clone(),
                });
                touched.insert(wallet.clone());
            }
            pending.insert(utxo.outpoint, (utxo, wallets));
        }

        if touched.is_empty() {
            continue;
        }
        let entry = TxIndexEntry {
            txid: tx.txid,
            height: block.height,
            position,
        };
        for wallet in touched {
            mutations.push(Mutation::IndexTx {
                wallet,
                entry: entry.clone(),
            });
        }
        mutations.push(Mutation::PutTx(TxDetail {
            txid: tx.txid,
            block_hash: block.hash,
            height: block.height,
            position,
            inputs: tx.inputs.clone(),
            outputs: tx.outputs.clone(),
        }));
    }

    mutations.extend(
        deltas
            .into_iter()
            .filter(|(_, delta)| *delta != 0)
            .map(|(wallet, delta)| Mutation::AdjustBalance { wallet, delta }),
    );
    Ok(mutations)
}

fn credit(
    deltas: &mut BTreeMap<WalletId, i64>,
    wallet: &WalletId,
    amount: i64,
) -> Result<(), IndexError> {
    let delta = deltas.entry(wallet.clone()).or_insert(0);
    *delta = delta
        .checked_add(amount)
        .ok_or_else(|| IndexError::BalanceOutOfRange(wallet.to_string()))?;
    Ok(())
}
