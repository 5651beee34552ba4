//! Core types, errors and traits for the tally wallet indexer.
//!
//! Shared by every other crate in the workspace: the domain model (wallets,
//! addresses, blocks, outputs, cursors), the invertible mutation model with
//! per-block undo data, the [`store::WalletStore`] trait with an in-memory
//! implementation, and the [`traits::ChainSource`] node interface.

pub mod constants;
pub mod error;
pub mod mutation;
pub mod store;
pub mod traits;
pub mod types;
