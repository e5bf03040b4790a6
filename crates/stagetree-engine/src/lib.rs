//! # stagetree-engine: Placement, reward ledger and stage progression.
//!
//! A confirmed purchase unit is placed breadth-first under its owner's stage
//! root, each affected ancestor is credited one leg, and any ancestor that
//! reaches its completion threshold opens the owner's next-stage root. All
//! writes of one unit land in a single [`StoreBatch`](stagetree_core::store::StoreBatch).

pub mod backoff;
pub mod engine;
pub mod ledger;
pub mod locks;
pub mod placement;
pub mod progression;
pub mod txn;

pub use backoff::{with_backoff, BackoffPolicy};
pub use engine::{Engine, EngineConfig};
pub use locks::{LockKey, LockTable};
