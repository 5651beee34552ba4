//! JSON-RPC server for the Tally wallet indexer.
//!
//! Uses jsonrpsee 0.24 to expose wallet registration and the cursor-paged
//! wallet queries over HTTP.

use std::net::SocketAddr;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use tally_core::error::{IndexError, TallyError, ValidationError};
use tally_core::store::WalletStore;
use tally_core::types::{Cursor, PageQuery, TxDetail, Utxo};
use tally_indexer::IndexerState;

use crate::query::QueryService;
use crate::registry::WalletRegistry;

/// Invalid parameter.
pub const RPC_INVALID_PARAMETER: i32 = -8;
/// Wallet id not registered.
pub const RPC_WALLET_NOT_FOUND: i32 = -4;
/// Wallet id already registered.
pub const RPC_WALLET_EXISTS: i32 = -6;
/// Indexer has not caught up with the node yet.
pub const RPC_NOT_READY: i32 = -28;
/// Storage, task or transport failure.
pub const RPC_INTERNAL: i32 = -1;

/// JSON representation of a wallet balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceJson {
    /// Confirmed balance in satoshis.
    pub balance: i64,
}

/// JSON representation of a page of transaction ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxidsJson {
    /// Transaction ids as hex, ascending by block position.
    pub txids: Vec<String>,
    /// Cursor of the last returned entry; absent on the final page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Cursor>,
}

/// JSON representation of a spent outpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputJson {
    pub txid: String,
    pub index: u32,
}

/// JSON representation of a transaction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputJson {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub satoshis: i64,
}

/// JSON representation of an indexed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionJson {
    /// Transaction id as hex.
    pub hash: String,
    /// Height of the containing block.
    pub height: u64,
    /// Containing block hash as hex.
    pub block_hash: String,
    /// Position within the block.
    pub index: u32,
    pub inputs: Vec<InputJson>,
    pub outputs: Vec<OutputJson>,
}

/// JSON representation of a page of transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsJson {
    pub transactions: Vec<TransactionJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Cursor>,
}

/// JSON representation of an unspent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoJson {
    pub address: String,
    pub satoshis: i64,
    /// Creating transaction id as hex.
    pub txid: String,
    /// Output index within the creating transaction.
    pub index: u32,
    pub height: u64,
}

/// JSON representation of a page of unspent outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxosJson {
    pub utxos: Vec<UtxoJson>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Cursor>,
}

/// JSON representation of service info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoJson {
    pub state: IndexerState,
    /// Height of the last applied block.
    pub height: Option<u64>,
    /// Node tip height as last seen.
    pub node_height: Option<u64>,
    /// Number of registered wallets.
    pub wallets: u64,
}

impl From<TxDetail> for TransactionJson {
    fn from(tx: TxDetail) -> Self {
        Self {
            hash: tx.txid.to_string(),
            height: tx.height,
            block_hash: tx.block_hash.to_string(),
            index: tx.position,
            inputs: tx
                .inputs
                .into_iter()
                .map(|input| InputJson {
                    txid: input.previous_output.txid.to_string(),
                    index: input.previous_output.index,
                })
                .collect(),
            outputs: tx
                .outputs
                .into_iter()
                .map(|output| OutputJson {
                    index: output.index,
                    address: output.address.map(String::from),
                    satoshis: output.satoshis,
                })
                .collect(),
        }
    }
}

impl From<Utxo> for UtxoJson {
    fn from(utxo: Utxo) -> Self {
        Self {
            address: utxo.address.to_string(),
            satoshis: utxo.satoshis,
            txid: utxo.outpoint.txid.to_string(),
            index: utxo.outpoint.index,
            height: utxo.height,
        }
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Map a service error onto a JSON-RPC error code.
pub fn to_rpc_error(err: TallyError) -> ErrorObjectOwned {
    let code = match &err {
        TallyError::Validation(ValidationError::UnknownWallet(_)) => RPC_WALLET_NOT_FOUND,
        TallyError::Validation(ValidationError::AlreadyExists(_)) => RPC_WALLET_EXISTS,
        TallyError::Validation(_) => RPC_INVALID_PARAMETER,
        TallyError::Index(IndexError::NotReady { .. }) => RPC_NOT_READY,
        _ => RPC_INTERNAL,
    };
    rpc_error(code, &err.to_string())
}

/// The Tally JSON-RPC interface.
#[rpc(server)]
pub trait TallyRpc {
    /// Registers a new, empty wallet.
    #[method(name = "createwallet")]
    async fn create_wallet(&self, wallet_id: String) -> Result<bool, ErrorObjectOwned>;

    /// Starts tracking an address for a wallet. Only blocks connected after
    /// the import are attributed to it.
    #[method(name = "importaddress")]
    async fn import_address(
        &self,
        wallet_id: String,
        address: String,
    ) -> Result<bool, ErrorObjectOwned>;

    /// Returns the confirmed balance of a wallet.
    #[method(name = "getbalance")]
    async fn get_balance(&self, wallet_id: String) -> Result<BalanceJson, ErrorObjectOwned>;

    /// Returns a page of transaction ids touching a wallet.
    #[method(name = "gettxids")]
    async fn get_txids(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<TxidsJson, ErrorObjectOwned>;

    /// Returns a page of transactions touching a wallet.
    #[method(name = "gettransactions")]
    async fn get_transactions(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<TransactionsJson, ErrorObjectOwned>;

    /// Returns a page of a wallet's unspent outputs.
    #[method(name = "getutxos")]
    async fn get_utxos(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<UtxosJson, ErrorObjectOwned>;

    /// Returns engine state, heights and wallet count.
    #[method(name = "getinfo")]
    async fn get_info(&self) -> Result<InfoJson, ErrorObjectOwned>;
}

/// Implementation of the Tally JSON-RPC server.
pub struct RpcServerImpl<S: WalletStore> {
    registry: WalletRegistry<S>,
    query: QueryService<S>,
}

impl<S: WalletStore> RpcServerImpl<S> {
    /// Create a new RPC server implementation over the registry and queries.
    pub fn new(registry: WalletRegistry<S>, query: QueryService<S>) -> Self {
        Self { registry, query }
    }
}

#[async_trait]
impl<S: WalletStore + 'static> TallyRpcServer for RpcServerImpl<S> {
    async fn create_wallet(&self, wallet_id: String) -> Result<bool, ErrorObjectOwned> {
        self.registry
            .create_wallet(&wallet_id)
            .map_err(to_rpc_error)?;
        Ok(true)
    }

    async fn import_address(
        &self,
        wallet_id: String,
        address: String,
    ) -> Result<bool, ErrorObjectOwned> {
        self.registry
            .import_address(&wallet_id, &address)
            .map_err(to_rpc_error)?;
        Ok(true)
    }

    async fn get_balance(&self, wallet_id: String) -> Result<BalanceJson, ErrorObjectOwned> {
        let balance = self.query.get_balance(&wallet_id).map_err(to_rpc_error)?;
        Ok(BalanceJson { balance })
    }

    async fn get_txids(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<TxidsJson, ErrorObjectOwned> {
        let page = self
            .query
            .get_txids(&wallet_id, &options.unwrap_or_default())
            .map_err(to_rpc_error)?;
        Ok(TxidsJson {
            txids: page.items.iter().map(|e| e.txid.to_string()).collect(),
            end: page.end,
        })
    }

    async fn get_transactions(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<TransactionsJson, ErrorObjectOwned> {
        let page = self
            .query
            .get_transactions(&wallet_id, &options.unwrap_or_default())
            .map_err(to_rpc_error)?;
        Ok(TransactionsJson {
            transactions: page.items.into_iter().map(TransactionJson::from).collect(),
            end: page.end,
        })
    }

    async fn get_utxos(
        &self,
        wallet_id: String,
        options: Option<PageQuery>,
    ) -> Result<UtxosJson, ErrorObjectOwned> {
        let page = self
            .query
            .get_utxos(&wallet_id, &options.unwrap_or_default())
            .map_err(to_rpc_error)?;
        Ok(UtxosJson {
            utxos: page.items.into_iter().map(UtxoJson::from).collect(),
            end: page.end,
        })
    }

    async fn get_info(&self) -> Result<InfoJson, ErrorObjectOwned> {
        let info = self.query.get_info().map_err(to_rpc_error)?;
        Ok(InfoJson {
            state: info.state,
            height: info.height,
            node_height: info.node_height,
            wallets: info.wallets,
        })
    }
}

/// Start the JSON-RPC server on the given address.
///
/// Returns a [`ServerHandle`] that can be used to stop the server, and the
/// bound address (useful when binding port 0).
pub async fn start_rpc_server<S: WalletStore + 'static>(
    addr: &str,
    registry: WalletRegistry<S>,
    query: QueryService<S>,
) -> Result<(ServerHandle, SocketAddr), TallyError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| TallyError::Internal(format!("RPC server error: {e}")))?;
    let local_addr = server
        .local_addr()
        .map_err(|e| TallyError::Internal(format!("RPC server error: {e}")))?;

    let rpc_impl = RpcServerImpl::new(registry, query);
    let handle = server.start(rpc_impl.into_rpc());

    Ok((handle, local_addr))
}
