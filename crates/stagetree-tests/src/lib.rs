//! Cross-crate test suite for Stagetree.
//!
//! Integration tests live under `tests/`: end-to-end stage scenarios,
//! concurrent placement and randomized ledger invariants.

pub mod helpers;
