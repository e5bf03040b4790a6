//! Engine facade.
//!
//! [`Engine`] wires placement, the reward ledger and stage progression
//! around a shared [`MatrixStore`]. Every purchase runs under the owner lock
//! and then the stage-tree lock, and commits as one batch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stagetree_core::constants::{
    Amount, DEFAULT_LOCK_TIMEOUT_MS, DEFAULT_STAGE_ONE_UNIT_BASE, FIRST_STAGE, MAX_STAGE,
};
use stagetree_core::error::{ConfigError, EngineError, StagetreeError, StructuralError};
use stagetree_core::profile::RewardProfile;
use stagetree_core::store::StoreBatch;
use stagetree_core::traits::{IdKind, MatrixStore};
use stagetree_core::types::{
    now_secs, OwnerId, PlacementReceipt, Position, PositionId, PositionSnapshot, PurchaseUnit,
    ReleaseRecord, RewardCategory, StageEconomy, TrancheChunk,
};

use crate::ledger::{credit_ancestors, credit_joining_bonus, tranche_report};
use crate::locks::{LockKey, LockTable};
use crate::placement::place_under;
use crate::progression::{complete_if_due, Progress};
use crate::txn::Txn;

/// Tunables that are not part of the reward profile.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Beneficiary of company-side entries and their releases.
    pub treasury: OwnerId,
    /// Per-unit base for stage-1 placements that carry no price.
    #[serde(with = "stagetree_core::amount_serde")]
    pub stage_one_unit_base: Amount,
    pub lock_timeout_ms: u64,
    /// Upper bound on nodes visited by one placement search.
    pub bfs_visit_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            treasury: OwnerId(0),
            stage_one_unit_base: DEFAULT_STAGE_ONE_UNIT_BASE,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            bfs_visit_limit: 1 << 22,
        }
    }
}

/// The matrix placement engine.
pub struct Engine {
    store: Arc<dyn MatrixStore>,
    profile: RewardProfile,
    config: EngineConfig,
    locks: LockTable,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("profile", &self.profile.name)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Build an engine after validating `profile` and `config`.
    pub fn new(
        store: Arc<dyn MatrixStore>,
        profile: RewardProfile,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        profile.validate()?;
        if config.stage_one_unit_base == 0 {
            return Err(ConfigError::InvalidField {
                field: "stage_one_unit_base",
                reason: "must be positive".into(),
            });
        }
        profile.validate_recurrence(config.stage_one_unit_base)?;
        if config.bfs_visit_limit == 0 {
            return Err(ConfigError::InvalidField {
                field: "bfs_visit_limit",
                reason: "must be at least 1".into(),
            });
        }
        tracing::info!(
            profile = %profile.name,
            width = profile.width,
            credit_depth = profile.credit_depth,
            threshold = profile.completion_threshold,
            treasury = %config.treasury,
            "engine ready"
        );
        Ok(Self {
            locks: LockTable::new(Duration::from_millis(config.lock_timeout_ms)),
            store,
            profile,
            config,
            clock: Box::new(now_secs),
        })
    }

    /// Replace the wall clock, for tests.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn profile(&self) -> &RewardProfile {
        &self.profile
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn MatrixStore> {
        &self.store
    }

    /// Place one confirmed purchase unit.
    ///
    /// Replaying an idempotency key returns the stored receipt and writes
    /// nothing.
    pub fn process_purchase(&self, unit: &PurchaseUnit) -> Result<PlacementReceipt, StagetreeError> {
        validate_stage(unit.stage)?;
        if unit.idempotency_key.trim().is_empty() {
            return Err(EngineError::InvalidUnit("empty idempotency key".into()).into());
        }
        if unit.stage == FIRST_STAGE && unit.unit_base_price == 0 {
            return Err(EngineError::InvalidUnit("zero unit base price".into()).into());
        }
        if let Some(receipt) = self.store.receipt(&unit.idempotency_key)? {
            tracing::debug!(key = %unit.idempotency_key, position = %receipt.position, "replayed purchase");
            return Ok(receipt);
        }
        self.execute(unit.owner, unit.stage, Some(unit.unit_base_price), Some(&unit.idempotency_key))
    }

    /// Place a unit at the stage's own price and return the new position.
    pub fn place_unit(&self, owner: OwnerId, stage: u32) -> Result<PositionSnapshot, StagetreeError> {
        validate_stage(stage)?;
        let receipt = self.execute(owner, stage, None, None)?;
        self.snapshot(receipt.position)
    }

    /// Every position of `owner`, ordered by `(stage, id)`.
    pub fn query_positions(&self, owner: OwnerId) -> Result<Vec<PositionSnapshot>, StagetreeError> {
        let mut positions = self.store.positions_of(owner)?;
        positions.sort_unstable_by_key(|p| (p.stage, p.id));
        positions.into_iter().map(|p| self.snapshot_of(p)).collect()
    }

    pub fn snapshot(&self, id: PositionId) -> Result<PositionSnapshot, StagetreeError> {
        let position = self
            .store
            .get_position(id)?
            .ok_or(StructuralError::PositionNotFound(id.get()))?;
        self.snapshot_of(position)
    }

    fn snapshot_of(&self, position: Position) -> Result<PositionSnapshot, StagetreeError> {
        let id = position.id;
        let economy = if position.is_root() { self.store.economy(id)? } else { None };
        Ok(PositionSnapshot {
            economy,
            child_count: self.store.child_count(id)?,
            completion_bonus_total: self.store.category_total(id, RewardCategory::CompletionBonus)?,
            next_stage_pool_total: self.store.category_total(id, RewardCategory::NextStagePool)?,
            unreleased_company_side: self.store.pending_release(id)?.amount,
            position,
        })
    }

    /// Completion-bonus entries of `position` grouped into tranches.
    pub fn tranche_report(&self, position: PositionId) -> Result<Vec<TrancheChunk>, StagetreeError> {
        tranche_report(self.store.as_ref(), &self.profile, position)
    }

    /// Move the position's unreleased company-side total to the treasury
    /// balance. Returns the amount released, zero if nothing was pending.
    pub fn admin_release_pending_payout(&self, position: PositionId) -> Result<Amount, StagetreeError> {
        let tree = self
            .store
            .get_position(position)?
            .ok_or(StructuralError::PositionNotFound(position.get()))?
            .root;

        self.locks.hold(&[LockKey::Tree(tree)], || {
            let pending = self.store.pending_release(position)?;
            let Some(through) = pending.through else {
                return Ok(0);
            };
            let mut batch = StoreBatch::default();
            batch.releases.push(ReleaseRecord {
                position,
                beneficiary: self.config.treasury,
                amount: pending.amount,
                released_through: through,
                created_at: (self.clock)(),
            });
            batch.credit(self.config.treasury, pending.amount);
            self.store.commit(batch)?;
            tracing::info!(position = %position, amount = pending.amount, through = %through, "company-side released");
            Ok(pending.amount)
        })
    }

    fn execute(
        &self,
        owner: OwnerId,
        stage: u32,
        unit_price: Option<Amount>,
        key: Option<&str>,
    ) -> Result<PlacementReceipt, StagetreeError> {
        self.locks.hold(&[LockKey::Owner(owner)], || {
            if let Some(key) = key {
                if let Some(receipt) = self.store.receipt(key)? {
                    return Ok(receipt);
                }
            }

            let mut txn = Txn::new(self.store.as_ref(), (self.clock)());
            let root = match txn.lowest_root(owner, stage)? {
                Some(root) => root,
                None if stage == FIRST_STAGE => self.open_first_stage(&mut txn, owner)?,
                None => return Err(EngineError::StageNotOpen { owner: owner.get(), stage }.into()),
            };

            self.locks
                .hold(&[LockKey::Tree(root)], || self.place_in(txn, owner, root, unit_price, key))
        })
    }

    fn open_first_stage(&self, txn: &mut Txn<'_>, owner: OwnerId) -> Result<PositionId, StagetreeError> {
        let id = PositionId(txn.next_id(IdKind::Position)?);
        let root = Position::new_root(id, owner, FIRST_STAGE, None, txn.now());
        txn.put_position(root)?;
        txn.put_economy(
            id,
            StageEconomy {
                stage: FIRST_STAGE,
                slot_price: self.config.stage_one_unit_base,
                completion_threshold: self.profile.completion_threshold,
                width: self.profile.width,
                pegged_total: None,
            },
        );
        tracing::info!(owner = %owner, root = %id, "stage 1 root opened");
        Ok(id)
    }

    fn place_in(
        &self,
        mut txn: Txn<'_>,
        owner: OwnerId,
        root: PositionId,
        unit_price: Option<Amount>,
        key: Option<&str>,
    ) -> Result<PlacementReceipt, StagetreeError> {
        let economy = txn.economy(root)?;
        let base = if economy.stage == FIRST_STAGE {
            unit_price.unwrap_or(self.config.stage_one_unit_base)
        } else {
            economy.slot_price
        };

        let placement = place_under(&mut txn, owner, root, self.config.bfs_visit_limit)?;
        credit_joining_bonus(&mut txn, &self.profile, &placement.position, base)?;

        let mut completed = Vec::new();
        let mut opened_roots = Vec::new();
        if !placement.fallback {
            let credits =
                credit_ancestors(&mut txn, &self.profile, self.config.treasury, &placement.position, base)?;
            for (_, mut ancestor) in credits {
                match complete_if_due(&mut txn, &self.profile, &mut ancestor)? {
                    Some(Progress::Opened { completed: done, root, .. }) => {
                        completed.push(done);
                        opened_roots.push(root);
                    }
                    Some(Progress::AlreadyOpened { completed: done, .. })
                    | Some(Progress::FinalStage { completed: done, .. }) => completed.push(done),
                    None => {}
                }
            }
        }

        let receipt = PlacementReceipt {
            idempotency_key: key.unwrap_or_default().to_string(),
            position: placement.position.id,
            entries: txn.staged_entry_ids(),
            completed,
            opened_roots,
            created_at: txn.now(),
        };
        if key.is_some() {
            txn.batch_mut().receipts.push(receipt.clone());
        }
        txn.commit()?;

        tracing::info!(
            owner = %owner,
            stage = economy.stage,
            position = %receipt.position,
            entries = receipt.entries.len(),
            completed = receipt.completed.len(),
            "unit placed"
        );
        Ok(receipt)
    }
}

fn validate_stage(stage: u32) -> Result<(), StagetreeError> {
    if !(FIRST_STAGE..=MAX_STAGE).contains(&stage) {
        return Err(EngineError::StageOutOfRange(stage).into());
    }
    Ok(())
}
