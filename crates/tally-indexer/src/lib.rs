//! Reorg-safe indexing engine for the tally wallet indexer.
//!
//! - [`changeset`]: reduces a block to invertible store mutations
//! - [`engine`]: the sequential consumer that applies connects and
//!   disconnects atomically and publishes its state

pub mod changeset;
pub mod engine;

pub use engine::{wait_until_live, Indexer, IndexerConfig, IndexerState, IndexerStatus};
