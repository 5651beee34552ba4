//! Core domain types: wallets, addresses, blocks, outputs, pagination.
//!
//! All monetary values are in satoshis (1 coin = 10^8 satoshis), carried as
//! `i64` so that balances and balance deltas share one type.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::{DEFAULT_PAGE_LIMIT, MAX_ADDRESS_LEN, MAX_PAGE_LIMIT, MAX_WALLET_ID_LEN};
use crate::error::ValidationError;

/// A 32-byte hash value, used for block hashes and transaction IDs.
///
/// Displayed, parsed and serialized as 64 lowercase hex characters.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(ValidationError::MalformedHash(s.to_string()));
        }
        let bytes = hex::decode(s).map_err(|_| ValidationError::MalformedHash(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ValidationError::MalformedHash(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque wallet identifier.
///
/// 1 to [`MAX_WALLET_ID_LEN`] ASCII characters from `[A-Za-z0-9_-]`.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(try_from = "String", into = "String")]
pub struct WalletId(String);

impl WalletId {
    /// Validate and wrap a wallet identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        let well_formed = !id.is_empty()
            && id.len() <= MAX_WALLET_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !well_formed {
            return Err(ValidationError::MalformedWalletId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for WalletId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WalletId> for String {
    fn from(id: WalletId) -> Self {
        id.0
    }
}

impl FromStr for WalletId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// An address string as reported by the node.
///
/// 1 to [`MAX_ADDRESS_LEN`] ASCII alphanumeric characters. The indexer does
/// not decode addresses; it only needs them to be stable map keys.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Validate and wrap an address string.
    pub fn new(address: impl Into<String>) -> Result<Self, ValidationError> {
        let address = address.into();
        let well_formed = !address.is_empty()
            && address.len() <= MAX_ADDRESS_LEN
            && address.bytes().all(|b| b.is_ascii_alphanumeric());
        if !well_formed {
            return Err(ValidationError::MalformedAddress(address));
        }
        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, consuming a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent.
    pub previous_output: OutPoint,
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Output index within the transaction.
    pub index: u32,
    /// Destination address; `None` for scripts without a standard address.
    pub address: Option<Address>,
    /// Value in satoshis.
    pub satoshis: i64,
}

/// A confirmed transaction as delivered by the node.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxRecord {
    /// Transaction ID.
    pub txid: Hash256,
    /// Inputs; empty for coinbase transactions.
    pub inputs: Vec<TxInput>,
    /// Outputs in index order.
    pub outputs: Vec<TxOutput>,
}

/// Height, hash and parent of a block on the indexed chain.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockRef {
    pub height: u64,
    pub hash: Hash256,
    pub parent_hash: Hash256,
}

/// A block delivered by the node: header linkage plus ordered transactions.
///
/// Transient; it only exists while its effects are being applied.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: Hash256,
    pub parent_hash: Hash256,
    pub transactions: Vec<TxRecord>,
}

impl BlockRecord {
    /// The block's position on the chain, without its transactions.
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            height: self.height,
            hash: self.hash,
            parent_hash: self.parent_hash,
        }
    }
}

/// Exclusive-start pagination key: `(height, index)` of the last item seen.
///
/// Ordered by height, then index.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Cursor {
    pub height: u64,
    pub index: u32,
}

/// An unspent output tracked for at least one wallet.
///
/// `ordinal` is the output's running position across all outputs of its
/// block, so `(height, ordinal)` is unique and ascends along the chain.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub address: Address,
    pub satoshis: i64,
    pub height: u64,
    pub ordinal: u32,
}

impl Utxo {
    /// Pagination key of this output.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            height: self.height,
            index: self.ordinal,
        }
    }
}

/// One row of a wallet's transaction-id index.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxIndexEntry {
    pub txid: Hash256,
    pub height: u64,
    /// Position of the transaction within its block.
    pub position: u32,
}

impl TxIndexEntry {
    /// Pagination key of this entry.
    pub fn cursor(&self) -> Cursor {
        Cursor {
            height: self.height,
            index: self.position,
        }
    }
}

/// A confirmed transaction that touched at least one tracked wallet.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxDetail {
    pub txid: Hash256,
    pub block_hash: Hash256,
    pub height: u64,
    pub position: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// Loosely-specified paging options as received at the API boundary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PageQuery {
    /// Height of the exclusive-start cursor.
    pub height: Option<u64>,
    /// Index of the exclusive-start cursor.
    pub index: Option<u32>,
    /// Maximum number of items; defaults to [`DEFAULT_PAGE_LIMIT`].
    pub limit: Option<usize>,
}

impl PageQuery {
    /// Continue after the given cursor with the given limit.
    pub fn after(cursor: Cursor, limit: Option<usize>) -> Self {
        Self {
            height: Some(cursor.height),
            index: Some(cursor.index),
            limit,
        }
    }

    /// Validate the options into a [`PageRequest`].
    ///
    /// `height` and `index` must be given together. A zero `limit` is
    /// rejected; anything above [`MAX_PAGE_LIMIT`] is clamped to it.
    pub fn validate(&self) -> Result<PageRequest, ValidationError> {
        let after = match (self.height, self.index) {
            (Some(height), Some(index)) => Some(Cursor { height, index }),
            (None, None) => None,
            _ => return Err(ValidationError::IncompleteCursor),
        };
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 {
            return Err(ValidationError::InvalidLimit(limit));
        }
        Ok(PageRequest { after, limit: limit.min(MAX_PAGE_LIMIT) })
    }
}

/// Validated paging request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<Cursor>,
    pub limit: usize,
}

/// One page of an ordered per-wallet index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor of the last returned item; `None` once the index is exhausted.
    pub end: Option<Cursor>,
}

impl<T> Page<T> {
    /// Build a page from up to `limit + 1` scanned items.
    ///
    /// The extra item only signals that more results exist; it is dropped.
    pub fn from_scan(mut scanned: Vec<T>, limit: usize, cursor_of: impl Fn(&T) -> Cursor) -> Self {
        let more = scanned.len() > limit;
        scanned.truncate(limit);
        let end = if more { scanned.last().map(cursor_of) } else { None };
        Self { items: scanned, end }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            end: self.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_display_roundtrips_through_from_str() {
        let h = Hash256([0xAB; 32]);
        let s = h.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(s.parse::<Hash256>().unwrap(), h);
    }

    #[test]
    fn hash_rejects_bad_hex() {
        assert!("zz".repeat(32).parse::<Hash256>().is_err());
        assert!("abcd".parse::<Hash256>().is_err());
    }

    #[test]
    fn hash_serializes_as_hex_string() {
        let h = Hash256([0x01; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: Hash256 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn wallet_id_validation() {
        assert!(WalletId::new("f4c4dd2e316dd51f962dba79816f4f36").is_ok());
        assert!(WalletId::new("my-wallet_1").is_ok());
        assert!(WalletId::new("").is_err());
        assert!(WalletId::new("has space").is_err());
        assert!(WalletId::new("x".repeat(MAX_WALLET_ID_LEN + 1)).is_err());
    }

    #[test]
    fn address_validation() {
        assert!(Address::new("mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef").is_ok());
        assert!(Address::new("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080").is_ok());
        assert!(Address::new("").is_err());
        assert!(Address::new("bad/address").is_err());
    }

    #[test]
    fn wallet_id_deserialize_validates() {
        assert!(serde_json::from_str::<WalletId>("\"ok\"").is_ok());
        assert!(serde_json::from_str::<WalletId>("\"not ok\"").is_err());
    }

    #[test]
    fn cursor_orders_by_height_then_index() {
        let a = Cursor { height: 1, index: 9 };
        let b = Cursor { height: 2, index: 0 };
        let c = Cursor { height: 2, index: 1 };
        assert!(a < b && b < c);
    }

    #[test]
    fn page_query_defaults() {
        let req = PageQuery::default().validate().unwrap();
        assert_eq!(req.after, None);
        assert_eq!(req.limit, DEFAULT_PAGE_LIMIT);
    }

    #[test]
    fn page_query_requires_complete_cursor() {
        let q = PageQuery { height: Some(5), ..PageQuery::default() };
        assert_eq!(q.validate().unwrap_err(), ValidationError::IncompleteCursor);
        let q = PageQuery { index: Some(5), ..PageQuery::default() };
        assert_eq!(q.validate().unwrap_err(), ValidationError::IncompleteCursor);
    }

    #[test]
    fn page_query_limit_bounds() {
        let zero = PageQuery { limit: Some(0), ..PageQuery::default() };
        assert_eq!(zero.validate().unwrap_err(), ValidationError::InvalidLimit(0));
        let huge = PageQuery { limit: Some(MAX_PAGE_LIMIT + 1), ..PageQuery::default() };
        assert_eq!(huge.validate().unwrap().limit, MAX_PAGE_LIMIT);
    }

    #[test]
    fn page_query_deserializes_missing_fields() {
        let q: PageQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(q, PageQuery::default());
        let q: PageQuery = serde_json::from_str(r#"{"height":3,"index":1,"limit":100}"#).unwrap();
        assert_eq!(q.validate().unwrap().after, Some(Cursor { height: 3, index: 1 }));
    }

    #[test]
    fn page_from_scan_sets_end_only_when_more_remain() {
        let cursor = |n: &u32| Cursor { height: 1, index: *n };
        let page = Page::from_scan(vec![0, 1, 2], 2, cursor);
        assert_eq!(page.items, vec![0, 1]);
        assert_eq!(page.end, Some(Cursor { height: 1, index: 1 }));

        let page = Page::from_scan(vec![0, 1], 2, cursor);
        assert_eq!(page.items, vec![0, 1]);
        assert_eq!(page.end, None);
    }
}
