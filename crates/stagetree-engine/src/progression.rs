//! Stage progression: completion detection and next-stage roots.
//!
//! When a position reaches its stage's completion threshold it is marked
//! completed and, below [`MAX_STAGE`], opens exactly one root for the same
//! owner one stage up. The new stage's slot price is the completing
//! position's next-stage pool total, or the pegged total when the next stage
//! is pegged.

use stagetree_core::constants::{Amount, MAX_STAGE};
use stagetree_core::error::{LedgerError, StagetreeError};
use stagetree_core::profile::RewardProfile;
use stagetree_core::traits::IdKind;
use stagetree_core::types::{
    OutboxEvent, Position, PositionId, PositionStatus, RewardCategory, StageEconomy,
};

use crate::txn::Txn;

/// What a completion produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// A next-stage root was opened.
    Opened { completed: PositionId, root: PositionId, slot_price: Amount },
    /// A successor already existed; nothing new was created.
    AlreadyOpened { completed: PositionId, root: PositionId },
    /// Completion at the last stage; handed to the outbox.
    FinalStage { completed: PositionId, company_side_total: Amount },
}

/// Economy frozen for a root opened at `stage` with the given pool total.
pub fn next_stage_economy(profile: &RewardProfile, stage: u32, pool_total: Amount) -> StageEconomy {
    let pegged_total = profile.pegged_total(stage);
    StageEconomy {
        stage,
        slot_price: pegged_total.unwrap_or(pool_total),
        completion_threshold: profile.completion_threshold,
        width: profile.width,
        pegged_total,
    }
}

/// Complete `position` if its legs reached the threshold.
///
/// Stages the status change, the successor root and its economy. Returns
/// `None` when the position is not yet due.
pub fn complete_if_due(
    txn: &mut Txn<'_>,
    profile: &RewardProfile,
    position: &mut Position,
) -> Result<Option<Progress>, StagetreeError> {
    let threshold = txn.economy(position.root)?.completion_threshold;
    if position.is_completed() || position.legs_filled < threshold {
        return Ok(None);
    }

    position.status = PositionStatus::Completed;
    txn.put_position(position.clone())?;
    tracing::info!(position = %position.id, owner = %position.owner, stage = position.stage, "position completed");

    if position.stage >= MAX_STAGE {
        let mut company_side_total: Amount = 0;
        for category in RewardCategory::COMPANY_SIDE {
            let total = txn.category_total(position.id, category)?;
            company_side_total = company_side_total.checked_add(total).ok_or(LedgerError::AmountOverflow)?;
        }
        txn.push_outbox(OutboxEvent::MaxStageCompleted {
            position: position.id,
            owner: position.owner,
            company_side_total,
        });
        tracing::info!(position = %position.id, company_side_total, "final stage completed, queued for re-entry");
        return Ok(Some(Progress::FinalStage { completed: position.id, company_side_total }));
    }

    if let Some(root) = txn.successor_of(position.id)? {
        tracing::warn!(position = %position.id, successor = %root, "successor already open");
        return Ok(Some(Progress::AlreadyOpened { completed: position.id, root }));
    }

    let next_stage = position.stage + 1;
    let pool_total = txn.category_total(position.id, RewardCategory::NextStagePool)?;
    let economy = next_stage_economy(profile, next_stage, pool_total);
    let slot_price = economy.slot_price;

    let id = PositionId(txn.next_id(IdKind::Position)?);
    let mut root = Position::new_root(id, position.owner, next_stage, Some(position.principal), txn.now());
    root.spawned_from = Some(position.id);
    txn.put_position(root)?;
    txn.put_economy(id, economy);

    tracing::info!(
        completed = %position.id,
        root = %id,
        stage = next_stage,
        slot_price,
        pegged = profile.pegged_total(next_stage).is_some(),
        "next stage opened"
    );
    Ok(Some(Progress::Opened { completed: position.id, root: id, slot_price }))
}
