//! Service constants. All monetary values in satoshis (1 coin = 10^8 satoshis).

pub const COIN: i64 = 100_000_000;

/// Page size used when a query does not name a limit.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

/// Largest page a single query may request.
pub const MAX_PAGE_LIMIT: usize = 1000;

/// Longest accepted wallet identifier, in bytes.
pub const MAX_WALLET_ID_LEN: usize = 128;

/// Longest accepted address string, in bytes (bech32 upper bound).
pub const MAX_ADDRESS_LEN: usize = 90;

/// Number of most recent blocks whose undo entries are retained.
///
/// A disconnect deeper than this cannot be unwound and requires a full
/// resync. 288 blocks is two days of bitcoin blocks.
pub const DEFAULT_UNDO_DEPTH: u64 = 288;

/// Interval between chain reconciliation passes when no notification arrives.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// Delay before retrying a failed node request.
pub const DEFAULT_SOURCE_RETRY_MS: u64 = 2_000;

/// Attempts made for a storage write before it is treated as fatal.
pub const DEFAULT_STORAGE_RETRIES: u32 = 3;

/// Fixed backoff between storage write attempts.
pub const DEFAULT_STORAGE_BACKOFF_MS: u64 = 250;

/// Capacity of the monitor → engine event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Attempts made by readiness waits before giving up.
pub const DEFAULT_READY_ATTEMPTS: u32 = 30;

/// Fixed backoff between readiness checks.
pub const DEFAULT_READY_INTERVAL_MS: u64 = 1_000;

/// Bitcoin network the indexed node runs on.
///
/// Selects the node's default RPC port, the service's own RPC port, and the
/// data directory suffix.
///
/// # Examples
///
/// ```
/// use tally_core::constants::NetworkType;
/// let net = NetworkType::default();
/// assert_eq!(net, NetworkType::Mainnet);
/// assert_eq!(net.data_dir_suffix(), "mainnet");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network.
    Regtest,
}

impl NetworkType {
    /// Default JSON-RPC port of a bitcoind node on this network.
    ///
    /// # Examples
    ///
    /// ```
    /// use tally_core::constants::NetworkType;
    /// assert_eq!(NetworkType::Regtest.default_node_rpc_port(), 18443);
    /// ```
    pub fn default_node_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 8332,
            Self::Testnet => 18332,
            Self::Regtest => 18443,
        }
    }

    /// Default TCP port for this service's JSON-RPC server.
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Self::Mainnet => 3380,
            Self::Testnet => 13380,
            Self::Regtest => 23380,
        }
    }

    /// Subdirectory appended to the data directory for this network.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}
