//! tally-cli: Command-line client for the Tally wallet indexer.
//!
//! Thin wrapper over the indexer's JSON-RPC interface: registers wallets and
//! addresses, and prints balances, history and unspent outputs as JSON.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Tally wallet indexer command-line client.
#[derive(Parser)]
#[command(name = "tally-cli")]
#[command(version, about = "Query and manage wallets on a Tally indexer")]
struct Cli {
    /// RPC endpoint URL.
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:3380")]
    rpc_endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new, empty wallet.
    Createwallet {
        wallet_id: String,
    },
    /// Track an address for a wallet from the next block on.
    Importaddress {
        wallet_id: String,
        address: String,
    },
    /// Confirmed balance of a wallet in satoshis.
    Getbalance {
        wallet_id: String,
    },
    /// Page through a wallet's transaction ids.
    Gettxids(PageArgs),
    /// Page through a wallet's transactions with inputs and outputs.
    Gettransactions(PageArgs),
    /// Page through a wallet's unspent outputs.
    Getutxos(PageArgs),
    /// Indexer state and heights.
    Getinfo,
}

#[derive(Args)]
struct PageArgs {
    wallet_id: String,

    /// Height of the exclusive-start cursor.
    #[arg(long, requires = "index")]
    height: Option<u64>,

    /// Index of the exclusive-start cursor.
    #[arg(long, requires = "height")]
    index: Option<u32>,

    /// Maximum number of results per page.
    #[arg(short, long)]
    limit: Option<usize>,

    /// Follow page cursors until the index is exhausted.
    #[arg(long)]
    all: bool,
}

impl PageArgs {
    fn options(&self) -> Value {
        let mut options = Map::new();
        if let Some(height) = self.height {
            options.insert("height".into(), json!(height));
        }
        if let Some(index) = self.index {
            options.insert("index".into(), json!(index));
        }
        if let Some(limit) = self.limit {
            options.insert("limit".into(), json!(limit));
        }
        Value::Object(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = HttpClientBuilder::default()
        .build(&cli.rpc_endpoint)
        .context("Failed to connect to RPC")?;

    let output = match cli.command {
        Commands::Createwallet { wallet_id } => {
            call(&client, "createwallet", vec![json!(wallet_id)]).await?
        }
        Commands::Importaddress { wallet_id, address } => {
            call(&client, "importaddress", vec![json!(wallet_id), json!(address)]).await?
        }
        Commands::Getbalance { wallet_id } => {
            call(&client, "getbalance", vec![json!(wallet_id)]).await?
        }
        Commands::Gettxids(args) => paged(&client, "gettxids", "txids", &args).await?,
        Commands::Gettransactions(args) => {
            paged(&client, "gettransactions", "transactions", &args).await?
        }
        Commands::Getutxos(args) => paged(&client, "getutxos", "utxos", &args).await?,
        Commands::Getinfo => call(&client, "getinfo", Vec::new()).await?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn call(client: &HttpClient, method: &str, args: Vec<Value>) -> Result<Value> {
    let mut params = ArrayParams::new();
    for arg in args {
        params.insert(arg)?;
    }
    debug!(method, "calling indexer");
    client
        .request(method, params)
        .await
        .with_context(|| format!("RPC {method} failed"))
}

/// Fetch one page, or every page when `--all` is set, merging the `key`
/// arrays into a single result.
async fn paged(client: &HttpClient, method: &str, key: &str, args: &PageArgs) -> Result<Value> {
    let mut options = args.options();
    let mut page = call(client, method, vec![json!(args.wallet_id), options.clone()]).await?;
    if !args.all {
        return Ok(page);
    }

    let mut items = take_items(&mut page, key)?;
    while let Some(end) = page.get("end").cloned() {
        options["height"] = end["height"].clone();
        options["index"] = end["index"].clone();
        page = call(client, method, vec![json!(args.wallet_id), options.clone()]).await?;
        items.extend(take_items(&mut page, key)?);
    }
    let mut merged = Map::new();
    merged.insert(key.to_string(), Value::Array(items));
    Ok(Value::Object(merged))
}

fn take_items(page: &mut Value, key: &str) -> Result<Vec<Value>> {
    match page.get_mut(key).map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => bail!("response is missing the {key} array"),
    }
}
