//! Reward ledger: per-leg credits, joining bonuses and tranche reports.

use stagetree_core::constants::Amount;
use stagetree_core::error::{LedgerError, StagetreeError, StructuralError};
use stagetree_core::profile::RewardProfile;
use stagetree_core::reward::{chunk_tranches, joining_bonus, leg_split, tranches_due};
use stagetree_core::traits::MatrixStore;
use stagetree_core::types::{EntryId, OwnerId, Position, PositionId, RewardCategory, TrancheChunk};

use crate::txn::Txn;

/// Result of crediting one leg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegCredit {
    pub position: PositionId,
    pub leg_index: u32,
    pub entries: Vec<EntryId>,
    /// Tranches newly earned by this leg.
    pub tranches_advanced: u32,
}

/// Credit the next leg on `position` and stage its entries.
///
/// The leg index is `legs_filled + 1`. Completion bonus goes to the position
/// owner and is credited to their balance in the same batch; company-side
/// categories go to `treasury` and wait for an explicit release.
pub fn credit_leg(
    txn: &mut Txn<'_>,
    profile: &RewardProfile,
    treasury: OwnerId,
    position: &mut Position,
    per_unit_base: Amount,
) -> Result<LegCredit, StagetreeError> {
    let economy = txn.economy(position.root)?;
    if position.is_completed() || position.legs_filled >= economy.completion_threshold {
        return Err(StructuralError::InvariantViolation {
            position: position.id.get(),
            detail: format!(
                "leg credit past threshold ({}/{})",
                position.legs_filled, economy.completion_threshold
            ),
        }
        .into());
    }

    let last_leg = txn
        .entries_for(position.id)?
        .iter()
        .filter(|e| e.category == RewardCategory::CompletionBonus)
        .map(|e| e.leg_index)
        .max()
        .unwrap_or(0);
    if last_leg != position.legs_filled {
        return Err(LedgerError::LegOutOfOrder {
            position: position.id.get(),
            expected: last_leg + 1,
            got: position.legs_filled + 1,
        }
        .into());
    }

    let leg_index = position.legs_filled + 1;
    let split = leg_split(profile, &economy, per_unit_base)?;
    let mut entries = Vec::with_capacity(2 + split.company_side.len());

    entries.push(txn.push_entry(
        position.owner,
        position,
        RewardCategory::CompletionBonus,
        leg_index,
        split.completion_bonus,
    )?);
    txn.credit(position.owner, split.completion_bonus);

    entries.push(txn.push_entry(
        position.owner,
        position,
        RewardCategory::NextStagePool,
        leg_index,
        split.next_stage_pool,
    )?);

    for (category, amount) in &split.company_side {
        entries.push(txn.push_entry(treasury, position, *category, leg_index, *amount)?);
    }

    position.legs_filled = leg_index;
    let due = tranches_due(leg_index, profile.tranche_size);
    let tranches_advanced = due.saturating_sub(position.tranches_paid);
    if tranches_advanced > 0 {
        position.tranches_paid = due;
        tracing::info!(position = %position.id, tranche = due, legs = leg_index, "tranche reached");
    }

    tracing::debug!(
        position = %position.id,
        leg = leg_index,
        mc = split.completion_bonus,
        nsp = split.next_stage_pool,
        "leg credited"
    );

    Ok(LegCredit { position: position.id, leg_index, entries, tranches_advanced })
}

/// Stage the buyer's joining bonus on their new position. Stage 1 only.
pub fn credit_joining_bonus(
    txn: &mut Txn<'_>,
    profile: &RewardProfile,
    buyer_position: &Position,
    per_unit_base: Amount,
) -> Result<Option<EntryId>, StagetreeError> {
    let amount = joining_bonus(profile, buyer_position.stage, per_unit_base)?;
    if amount == 0 {
        return Ok(None);
    }
    let id = txn.push_entry(
        buyer_position.owner,
        buyer_position,
        RewardCategory::JoiningBonus,
        0,
        amount,
    )?;
    txn.credit(buyer_position.owner, amount);
    Ok(Some(id))
}

/// Credit up to `credit_depth` ancestors of `child`, nearest first.
///
/// Completed ancestors are skipped but still count toward the depth.
/// Returns the credits and the updated ancestors.
pub fn credit_ancestors(
    txn: &mut Txn<'_>,
    profile: &RewardProfile,
    treasury: OwnerId,
    child: &Position,
    per_unit_base: Amount,
) -> Result<Vec<(LegCredit, Position)>, StagetreeError> {
    let mut credits = Vec::new();
    let mut next = child.parent;
    for _ in 0..profile.credit_depth {
        let Some(id) = next else { break };
        let mut ancestor = txn.position(id)?;
        next = ancestor.parent;
        if ancestor.is_completed() {
            tracing::trace!(position = %id, "completed ancestor skipped");
            continue;
        }
        let credit = credit_leg(txn, profile, treasury, &mut ancestor, per_unit_base)?;
        txn.put_position(ancestor.clone())?;
        credits.push((credit, ancestor));
    }
    Ok(credits)
}

/// Completion-bonus entries on `position` grouped into tranches.
pub fn tranche_report(
    store: &dyn MatrixStore,
    profile: &RewardProfile,
    position: PositionId,
) -> Result<Vec<TrancheChunk>, StagetreeError> {
    if store.get_position(position)?.is_none() {
        return Err(StructuralError::PositionNotFound(position.get()).into());
    }
    let legs: Vec<(u32, Amount)> = store
        .entries_for(position)?
        .iter()
        .filter(|e| e.category == RewardCategory::CompletionBonus)
        .map(|e| (e.leg_index, e.amount))
        .collect();
    Ok(chunk_tranches(&legs, profile.tranche_size)?)
}
