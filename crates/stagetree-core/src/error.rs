//! Error types for Stagetree.
use thiserror::Error;

use crate::constants::Amount;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no reward profile selected")] MissingProfile,
    #[error("unknown reward profile: {0}")] UnknownProfile(String),
    #[error("category split exceeds 100% at stage {stage}: {total_bps} bps")] SplitOverflow { stage: u32, total_bps: u64 },
    #[error("invalid {field}: {reason}")] InvalidField { field: &'static str, reason: String },
    #[error("completion threshold {threshold} unreachable with width {width} and credit depth {depth} (capacity {capacity})")] UnreachableThreshold { threshold: u32, width: u32, depth: u32, capacity: u64 },
    #[error("pegged stage {0} outside 2..=MAX_STAGE")] PeggedStageOutOfRange(u32),
    #[error("missing pegged total for stage {0}")] MissingPeggedEntry(u32),
    #[error("config source: {0}")] Source(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("invariant violation on position {position}: {detail}")] InvariantViolation { position: u64, detail: String },
    #[error("no capacity under root {root}")] InsufficientCapacity { root: u64 },
    #[error("position not found: {0}")] PositionNotFound(u64),
    #[error("economy missing for root {0}")] EconomyMissing(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("duplicate entry: position {position} {category} leg {leg_index}")] DuplicateEntry { position: u64, category: String, leg_index: u32 },
    #[error("leg {got} out of order on position {position}, expected {expected}")] LegOutOfOrder { position: u64, expected: u32, got: u32 },
    #[error("receipt already recorded for key {0}")] DuplicateReceipt(String),
    #[error("amount overflow")] AmountOverflow,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("insufficient balance for owner {owner}: have {have}, need {need}")] Insufficient { owner: u64, have: Amount, need: Amount },
    #[error("zero amount")] ZeroAmount,
    #[error("balance overflow for owner {0}")] Overflow(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("lock wait timed out on {0}")] ConcurrencyConflict(String),
    #[error("stage {stage} not open for owner {owner}")] StageNotOpen { owner: u64, stage: u32 },
    #[error("stage {0} out of range")] StageOutOfRange(u32),
    #[error("invalid purchase unit: {0}")] InvalidUnit(String),
    #[error("retries exhausted after {attempts} attempts")] RetriesExhausted { attempts: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalError {
    #[error("withdrawal not found: {0}")] NotFound(u64),
    #[error("invalid transition for withdrawal {id}: {from} -> {to}")] InvalidTransition { id: u64, from: String, to: String },
    #[error("payout rail: {0}")] Rail(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeLockError {
    #[error("time lock not found: {0}")] NotFound(u64),
    #[error("time lock {0} already released")] AlreadyReleased(u64),
}

#[derive(Error, Debug)]
pub enum StagetreeError {
    #[error(transparent)] Config(#[from] ConfigError),
    #[error(transparent)] Structural(#[from] StructuralError),
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error(transparent)] Balance(#[from] BalanceError),
    #[error(transparent)] Engine(#[from] EngineError),
    #[error(transparent)] Withdrawal(#[from] WithdrawalError),
    #[error(transparent)] TimeLock(#[from] TimeLockError),
    #[error("storage: {0}")] Storage(String),
}

impl StagetreeError {
    /// Whether the caller may retry the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine(EngineError::ConcurrencyConflict(_)))
    }
}
