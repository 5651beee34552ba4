//! Scenario and property test suite for the tally wallet indexer.
//!
//! Integration tests drive the full pipeline (simulated node, chain monitor,
//! indexing engine, store, queries) through receive, spend, reorg and
//! pagination scenarios, and check the store invariants under random block
//! sequences.

pub mod helpers;
