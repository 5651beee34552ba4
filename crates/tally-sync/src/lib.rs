//! Chain sync monitor for the tally wallet indexer.
//!
//! [`monitor::ChainMonitor`] follows a [`tally_core::traits::ChainSource`]
//! and emits an ordered stream of connect/disconnect events for the indexing
//! engine, with readiness published on a watch channel.

pub mod monitor;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use monitor::{ChainEvent, ChainMonitor, MonitorConfig, SyncProgress};
