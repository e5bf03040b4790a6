//! Per-leg reward arithmetic.
//!
//! Every new leg on a position is split against the per-unit base:
//! - completion bonus (MC) to the position owner,
//! - next-stage pool (NSP), which funds the next stage's slot price,
//! - one amount per non-zero company-side category.
//!
//! A pegged stage replaces the MC rate with `pegged_total / completion_threshold`
//! per leg. The joining bonus (JB) is paid to the buyer at stage 1 only.
//!
//! All functions here are pure; the engine decides which positions are credited.
//! Arithmetic is checked and reports [`LedgerError::AmountOverflow`].

use crate::constants::{apply_bps, checked_sum, Amount, FIRST_STAGE};
use crate::error::LedgerError;
use crate::profile::RewardProfile;
use crate::types::{RewardCategory, StageEconomy, TrancheChunk};

/// Amounts owed for one leg on one position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegSplit {
    pub completion_bonus: Amount,
    pub next_stage_pool: Amount,
    /// Non-zero company-side amounts, in [`RewardCategory::COMPANY_SIDE`] order.
    pub company_side: Vec<(RewardCategory, Amount)>,
}

impl LegSplit {
    pub fn company_side_total(&self) -> Result<Amount, LedgerError> {
        checked_sum(self.company_side.iter().map(|(_, a)| *a)).ok_or(LedgerError::AmountOverflow)
    }

    pub fn total(&self) -> Result<Amount, LedgerError> {
        checked_sum([self.completion_bonus, self.next_stage_pool, self.company_side_total()?])
            .ok_or(LedgerError::AmountOverflow)
    }
}

fn bps_of(amount: Amount, bps: u64) -> Result<Amount, LedgerError> {
    apply_bps(amount, bps).ok_or(LedgerError::AmountOverflow)
}

/// Completion bonus per leg for a pegged stage. Truncates toward zero.
pub fn pegged_leg_amount(pegged_total: Amount, completion_threshold: u32) -> Amount {
    if completion_threshold == 0 {
        return 0;
    }
    pegged_total / completion_threshold as Amount
}

/// Split one leg on a position whose tree runs under `economy`.
pub fn leg_split(
    profile: &RewardProfile,
    economy: &StageEconomy,
    per_unit_base: Amount,
) -> Result<LegSplit, LedgerError> {
    let split = profile.split.for_stage(economy.stage);

    let completion_bonus = match economy.pegged_total {
        Some(total) => pegged_leg_amount(total, economy.completion_threshold),
        None => bps_of(per_unit_base, split.completion_bonus_bps)?,
    };

    let mut company_side = Vec::with_capacity(RewardCategory::COMPANY_SIDE.len());
    for category in RewardCategory::COMPANY_SIDE {
        let amount = bps_of(per_unit_base, split.bps(category))?;
        if amount > 0 {
            company_side.push((category, amount));
        }
    }

    Ok(LegSplit {
        completion_bonus,
        next_stage_pool: bps_of(per_unit_base, split.next_stage_pool_bps)?,
        company_side,
    })
}

/// Joining bonus owed to a buyer placed at `stage`. Zero above stage 1.
pub fn joining_bonus(profile: &RewardProfile, stage: u32, per_unit_base: Amount) -> Result<Amount, LedgerError> {
    if stage != FIRST_STAGE {
        return Ok(0);
    }
    bps_of(per_unit_base, profile.split.joining_bonus_bps)
}

/// Tranches fully earned after `legs_filled` legs.
pub fn tranches_due(legs_filled: u32, tranche_size: u32) -> u32 {
    if tranche_size == 0 {
        return 0;
    }
    legs_filled / tranche_size
}

/// Group `(leg_index, amount)` completion-bonus lines into tranches.
///
/// Lines may arrive in any order. A trailing tranche shorter than
/// `tranche_size` is returned with `complete = false`.
pub fn chunk_tranches(legs: &[(u32, Amount)], tranche_size: u32) -> Result<Vec<TrancheChunk>, LedgerError> {
    if tranche_size == 0 || legs.is_empty() {
        return Ok(Vec::new());
    }
    let mut sorted = legs.to_vec();
    sorted.sort_unstable_by_key(|(leg, _)| *leg);

    let mut chunks: Vec<TrancheChunk> = Vec::new();
    for (leg, amount) in sorted {
        let index = (leg.saturating_sub(1)) / tranche_size + 1;
        match chunks.last_mut() {
            Some(chunk) if chunk.index == index => {
                chunk.last_leg = leg;
                chunk.amount = chunk.amount.checked_add(amount).ok_or(LedgerError::AmountOverflow)?;
            }
            _ => chunks.push(TrancheChunk {
                index,
                first_leg: leg,
                last_leg: leg,
                amount,
                complete: false,
            }),
        }
    }
    for chunk in &mut chunks {
        chunk.complete = chunk.last_leg - chunk.first_leg + 1 == tranche_size;
    }
    Ok(chunks)
}
