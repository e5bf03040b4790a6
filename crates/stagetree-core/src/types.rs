//! Core ledger types: positions, reward entries, stage economies, receipts.
//!
//! All monetary values are in minor units (1 token = 10^8 minor units).
//! Identifiers are plain `u64` newtypes allocated in creation order, so
//! ascending id is also ascending creation time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::Amount;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            Default, bincode::Encode, bincode::Decode,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(v: u64) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Identifier of an account holder (buyer, beneficiary, treasury).
    OwnerId, "owner#"
);
id_type!(
    /// Identifier of a matrix position.
    PositionId, "pos#"
);
id_type!(
    /// Identifier of a reward ledger entry.
    EntryId, "entry#"
);
id_type!(TimeLockId, "lock#");
id_type!(WithdrawalId, "wd#");

/// Current wall-clock time as Unix seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Lifecycle of a position.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub enum PositionStatus {
    Open,
    Completed,
}

/// A node in a stage's placement tree.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Position {
    pub id: PositionId,
    pub owner: OwnerId,
    pub stage: u32,
    /// `None` marks a stage root.
    pub parent: Option<PositionId>,
    /// Stage root of the tree this position sits in.
    pub root: PositionId,
    /// Stage-1 root of the lineage this position belongs to.
    pub principal: PositionId,
    /// Distance from the tree root (0 for roots).
    pub depth: u32,
    pub legs_filled: u32,
    pub tranches_paid: u32,
    pub status: PositionStatus,
    /// The completing position that opened this root, for next-stage roots.
    pub spawned_from: Option<PositionId>,
    pub created_at: u64,
}

impl Position {
    /// A fresh root at `stage`. Its principal is itself unless inherited.
    pub fn new_root(id: PositionId, owner: OwnerId, stage: u32, principal: Option<PositionId>, created_at: u64) -> Self {
        Self {
            id,
            owner,
            stage,
            parent: None,
            root: id,
            principal: principal.unwrap_or(id),
            depth: 0,
            legs_filled: 0,
            tranches_paid: 0,
            status: PositionStatus::Open,
            spawned_from: None,
            created_at,
        }
    }

    /// A fresh child placed directly under `parent`.
    pub fn new_child(id: PositionId, owner: OwnerId, parent: &Position, created_at: u64) -> Self {
        Self {
            id,
            owner,
            stage: parent.stage,
            parent: Some(parent.id),
            root: parent.root,
            principal: parent.principal,
            depth: parent.depth + 1,
            legs_filled: 0,
            tranches_paid: 0,
            status: PositionStatus::Open,
            spawned_from: None,
            created_at,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_completed(&self) -> bool {
        self.status == PositionStatus::Completed
    }
}

/// Reward split categories.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub enum RewardCategory {
    /// Paid to the owner of the position whose leg was filled.
    CompletionBonus,
    /// Paid to the buyer, stage 1 only.
    JoiningBonus,
    /// Accumulates into the next stage's entry price.
    NextStagePool,
    CompanyReserve,
    LiquidityPool,
    CompanyProfit,
}

impl RewardCategory {
    pub const ALL: [RewardCategory; 6] = [
        Self::CompletionBonus,
        Self::JoiningBonus,
        Self::NextStagePool,
        Self::CompanyReserve,
        Self::LiquidityPool,
        Self::CompanyProfit,
    ];

    pub const COMPANY_SIDE: [RewardCategory; 3] =
        [Self::CompanyReserve, Self::LiquidityPool, Self::CompanyProfit];

    /// Company-side entries are held in the ledger until an explicit release.
    pub fn is_company_side(self) -> bool {
        matches!(self, Self::CompanyReserve | Self::LiquidityPool | Self::CompanyProfit)
    }

    /// Stable single-byte tag used in storage keys.
    pub fn tag(self) -> u8 {
        match self {
            Self::CompletionBonus => 0,
            Self::JoiningBonus => 1,
            Self::NextStagePool => 2,
            Self::CompanyReserve => 3,
            Self::LiquidityPool => 4,
            Self::CompanyProfit => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }

    /// Short ledger code, used in logs.
    pub fn code(self) -> &'static str {
        match self {
            Self::CompletionBonus => "MC",
            Self::JoiningBonus => "JB",
            Self::NextStagePool => "NSP",
            Self::CompanyReserve => "CR",
            Self::LiquidityPool => "LP",
            Self::CompanyProfit => "CP",
        }
    }
}

impl fmt::Display for RewardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One immutable line of the reward ledger.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct RewardEntry {
    pub id: EntryId,
    pub beneficiary: OwnerId,
    pub position: PositionId,
    pub category: RewardCategory,
    pub stage: u32,
    /// 1-based leg number on `position`; 0 for joining bonuses.
    pub leg_index: u32,
    pub amount: Amount,
    pub created_at: u64,
}

/// Frozen economics of one opened stage root.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StageEconomy {
    pub stage: u32,
    /// Entry price of the stage; the per-unit base for stages above 1.
    pub slot_price: Amount,
    pub completion_threshold: u32,
    pub width: u32,
    pub pegged_total: Option<Amount>,
}

/// A confirmed purchase unit delivered by the purchase pipeline.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PurchaseUnit {
    pub owner: OwnerId,
    pub stage: u32,
    pub unit_base_price: Amount,
    pub idempotency_key: String,
}

/// Durable result of one processed purchase unit, keyed by idempotency key.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct PlacementReceipt {
    pub idempotency_key: String,
    pub position: PositionId,
    pub entries: Vec<EntryId>,
    pub completed: Vec<PositionId>,
    pub opened_roots: Vec<PositionId>,
    pub created_at: u64,
}

/// An operator release of a position's company-side entries.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ReleaseRecord {
    pub position: PositionId,
    pub beneficiary: OwnerId,
    pub amount: Amount,
    /// Highest company-side entry id covered by this release.
    pub released_through: EntryId,
    pub created_at: u64,
}

/// Durable hand-off to routines outside the engine.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum OutboxEvent {
    /// A position at the last stage completed; its company-side proceeds
    /// belong to the external re-entry routine.
    MaxStageCompleted { position: PositionId, owner: OwnerId, company_side_total: Amount },
    /// Operator review queue item for a structural invariant violation.
    InvariantViolation { position: PositionId, detail: String },
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum TimeLockStatus {
    Locked,
    Released,
}

/// A time-locked deposit released by the unlock sweep.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TimeLock {
    pub id: TimeLockId,
    pub owner: OwnerId,
    pub amount: Amount,
    pub reward: Amount,
    pub locked_at: u64,
    pub unlock_at: u64,
    pub status: TimeLockStatus,
}

impl TimeLock {
    pub fn is_mature(&self, now: u64) -> bool {
        self.status == TimeLockStatus::Locked && self.unlock_at <= now
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum WithdrawalMethod {
    Bank { reference: String },
    Token { address: String },
}

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum WithdrawalStatus {
    Pending,
    ReadyForManual,
    ReadyForBank,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::ReadyForManual => "ready_for_manual",
            Self::ReadyForBank => "ready_for_bank",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Withdrawal {
    pub id: WithdrawalId,
    pub owner: OwnerId,
    pub amount: Amount,
    pub method: WithdrawalMethod,
    pub status: WithdrawalStatus,
    pub created_at: u64,
    pub updated_at: u64,
    /// Payout reference or failure reason.
    pub note: Option<String>,
}

/// Read-side view of a position with its ledger totals.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PositionSnapshot {
    pub position: Position,
    /// Present for stage roots.
    pub economy: Option<StageEconomy>,
    pub child_count: u32,
    pub completion_bonus_total: Amount,
    pub next_stage_pool_total: Amount,
    pub unreleased_company_side: Amount,
}

/// One payable tranche of completion-bonus legs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TrancheChunk {
    /// 1-based tranche number.
    pub index: u32,
    pub first_leg: u32,
    pub last_leg: u32,
    pub amount: Amount,
    /// False for a trailing tranche that has not reached its full size.
    pub complete: bool,
}
