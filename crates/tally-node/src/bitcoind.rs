//! bitcoind JSON-RPC chain source.
//!
//! Fetches heights, hashes and verbose blocks (`getblock <hash> 2`) from a
//! node and feeds tip notifications from a polling task, since bitcoind has
//! no push channel over plain JSON-RPC.

use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Error as ClientError};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use tally_core::constants::COIN;
use tally_core::error::SourceError;
use tally_core::traits::{ChainSource, NodeNotification, NotificationKind};
use tally_core::types::{
    Address, BlockRecord, Hash256, OutPoint, TxInput, TxOutput, TxRecord,
};

/// bitcoind error code for an unknown block hash.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// bitcoind error code for a height outside the active chain.
const RPC_INVALID_PARAMETER: i32 = -8;

/// Verbose block as returned by `getblock <hash> 2`.
#[derive(Debug, Deserialize)]
struct BlockJson {
    hash: String,
    height: u64,
    #[serde(default)]
    previousblockhash: Option<String>,
    tx: Vec<TxJson>,
}

#[derive(Debug, Deserialize)]
struct TxJson {
    txid: String,
    vin: Vec<VinJson>,
    vout: Vec<VoutJson>,
}

/// Coinbase inputs carry no `txid`.
#[derive(Debug, Deserialize)]
struct VinJson {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VoutJson {
    /// Amount in BTC.
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKeyJson,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptPubKeyJson {
    #[serde(default)]
    address: Option<String>,
    /// Pre-22.0 nodes report a list instead of `address`.
    #[serde(default)]
    addresses: Option<Vec<String>>,
}

/// [`ChainSource`] backed by a bitcoind node.
pub struct BitcoindSource {
    client: HttpClient,
    notifications: broadcast::Sender<NodeNotification>,
}

impl BitcoindSource {
    /// Connect to the node at `url`, optionally with basic-auth credentials.
    pub fn new(
        url: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, SourceError> {
        let endpoint = authenticated_url(url, user, password);
        let client = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(60))
            .build(&endpoint)
            .map_err(|e| SourceError::Unavailable(format!("node client: {e}")))?;
        let (notifications, _) = broadcast::channel(256);
        Ok(Self {
            client,
            notifications,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: ArrayParams,
    ) -> Result<T, SourceError> {
        self.client
            .request(method, params)
            .await
            .map_err(|e| source_error(method, e))
    }

    /// Poll the node's best block hash and publish a connect notification
    /// whenever it changes. Runs until `shutdown` flips to `true`.
    pub async fn watch_tip(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut last: Option<Hash256> = None;
        loop {
            match self.best_tip().await {
                Ok((height, hash)) if last != Some(hash) => {
                    last = Some(hash);
                    debug!(height, %hash, "node tip changed");
                    // No subscriber is fine; the monitor also polls.
                    let _ = self.notifications.send(NodeNotification {
                        kind: NotificationKind::Connect,
                        height,
                        hash,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "tip poll failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                return;
            }
        }
    }

    async fn best_tip(&self) -> Result<(u64, Hash256), SourceError> {
        let height = self.best_height().await?;
        let hash = self.block_hash(height).await?;
        Ok((height, hash))
    }
}

#[async_trait]
impl ChainSource for BitcoindSource {
    async fn best_height(&self) -> Result<u64, SourceError> {
        self.call("getblockcount", ArrayParams::new()).await
    }

    async fn block_hash(&self, height: u64) -> Result<Hash256, SourceError> {
        let mut params = ArrayParams::new();
        params
            .insert(height)
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        let hash: String = self.call("getblockhash", params).await?;
        parse_hash(&hash)
    }

    async fn block(&self, hash: &Hash256) -> Result<BlockRecord, SourceError> {
        let mut params = ArrayParams::new();
        params
            .insert(hash.to_string())
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        params
            .insert(2u8)
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        let block: BlockJson = self.call("getblock", params).await?;
        block_record(block)
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeNotification> {
        self.notifications.subscribe()
    }
}

/// Embed basic-auth credentials into the endpoint URL.
fn authenticated_url(url: &str, user: Option<&str>, password: Option<&str>) -> String {
    let Some(user) = user else {
        return url.to_string();
    };
    let credentials = match password {
        Some(password) => format!("{user}:{password}@"),
        None => format!("{user}@"),
    };
    match url.split_once("://") {
        Some((scheme, rest)) => format!("{scheme}://{credentials}{rest}"),
        None => format!("http://{credentials}{url}"),
    }
}

fn source_error(method: &str, err: ClientError) -> SourceError {
    match err {
        ClientError::Call(obj)
            if obj.code() == RPC_INVALID_ADDRESS_OR_KEY || obj.code() == RPC_INVALID_PARAMETER =>
        {
            SourceError::BlockNotFound(format!("{method}: {}", obj.message()))
        }
        ClientError::ParseError(e) => SourceError::Malformed(format!("{method}: {e}")),
        other => SourceError::Unavailable(format!("{method}: {other}")),
    }
}

fn parse_hash(hex_str: &str) -> Result<Hash256, SourceError> {
    hex_str
        .parse::<Hash256>()
        .map_err(|e| SourceError::Malformed(e.to_string()))
}

/// Convert a BTC amount to satoshis, rounding to the nearest unit.
pub fn btc_to_satoshis(value: f64) -> Result<i64, SourceError> {
    let satoshis = (value * COIN as f64).round();
    if !satoshis.is_finite() || satoshis < 0.0 || satoshis > i64::MAX as f64 {
        return Err(SourceError::Malformed(format!("amount out of range: {value}")));
    }
    Ok(satoshis as i64)
}

fn block_record(block: BlockJson) -> Result<BlockRecord, SourceError> {
    let parent_hash = match &block.previousblockhash {
        Some(hash) => parse_hash(hash)?,
        None => Hash256::ZERO,
    };
    let transactions = block
        .tx
        .into_iter()
        .map(tx_record)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(BlockRecord {
        height: block.height,
        hash: parse_hash(&block.hash)?,
        parent_hash,
        transactions,
    })
}

fn tx_record(tx: TxJson) -> Result<TxRecord, SourceError> {
    let mut inputs = Vec::with_capacity(tx.vin.len());
    for vin in tx.vin {
        // Coinbase.
        let (Some(txid), Some(index)) = (vin.txid, vin.vout) else {
            continue;
        };
        inputs.push(TxInput {
            previous_output: OutPoint {
                txid: parse_hash(&txid)?,
                index,
            },
        });
    }
    let mut outputs = Vec::with_capacity(tx.vout.len());
    for vout in tx.vout {
        let script = vout.script_pub_key;
        let address = script
            .address
            .or_else(|| script.addresses.and_then(|a| a.into_iter().next()))
            .and_then(|a| Address::new(a).ok());
        outputs.push(TxOutput {
            index: vout.n,
            address,
            satoshis: btc_to_satoshis(vout.value)?,
        });
    }
    Ok(TxRecord {
        txid: parse_hash(&tx.txid)?,
        inputs,
        outputs,
    })
}
