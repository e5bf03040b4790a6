//! # stagetree-node: RocksDB storage, scheduled jobs and RPC.
//!
//! Composes the placement engine into a running service:
//! - [`storage::RocksStore`]: persistent matrix and balance state backed by RocksDB
//! - [`node::Node`]: wiring of storage, engine, unlock sweep and withdrawals
//! - [`unlock`]: time-locked deposits and the unlock sweep
//! - [`withdrawal`]: withdrawal workflow and payout rails
//! - [`rpc`]: JSON-RPC server for external access
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod node;
pub mod rpc;
pub mod storage;
pub mod unlock;
pub mod withdrawal;

pub use config::NodeConfig;
pub use node::Node;
pub use rpc::start_rpc_server;
pub use storage::RocksStore;
