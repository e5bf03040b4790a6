//! # stagetree-core
//! Foundation types, reward profiles and store contracts for Stagetree.

pub mod amount_serde;
pub mod constants;
pub mod error;
pub mod profile;
pub mod reward;
pub mod simulation;
pub mod store;
pub mod traits;
pub mod types;
