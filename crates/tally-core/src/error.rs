//! Error types for the wallet indexer.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown wallet: {0}")] UnknownWallet(String),
    #[error("wallet already exists: {0}")] AlreadyExists(String),
    #[error("malformed wallet id: {0}")] MalformedWalletId(String),
    #[error("malformed address: {0}")] MalformedAddress(String),
    #[error("malformed hash: {0}")] MalformedHash(String),
    #[error("cursor requires both height and index")] IncompleteCursor,
    #[error("invalid limit: {0}")] InvalidLimit(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate block {hash} at height {height}")] DuplicateBlock { height: u64, hash: String },
    #[error("block {hash} at height {height} does not extend tip {tip_height:?}")] OutOfOrder { height: u64, hash: String, tip_height: Option<u64> },
    #[error("reorg depth exceeded: no undo entry for block {hash} at height {height}")] ReorgDepthExceeded { height: u64, hash: String },
    #[error("balance out of range for wallet {0}")] BalanceOutOfRange(String),
    #[error("indexer not live after {attempts} attempts")] NotReady { attempts: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("node unavailable: {0}")] Unavailable(String),
    #[error("malformed node response: {0}")] Malformed(String),
    #[error("block not found: {0}")] BlockNotFound(String),
}

#[derive(Error, Debug)]
pub enum TallyError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Index(#[from] IndexError),
    #[error(transparent)] Source(#[from] SourceError),
    #[error("storage: {0}")] Storage(String),
    #[error("internal: {0}")] Internal(String),
}

impl TallyError {
    /// Whether the error came from the persistence layer and may succeed on retry.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Whether the error is an idempotent replay of an already-applied
    /// (or already-reverted) block.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Index(IndexError::DuplicateBlock { .. }))
    }
}
