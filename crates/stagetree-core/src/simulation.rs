//! Offline stage projection.
//!
//! Walks the same recurrence the engine applies live: one position fills
//! `completion_threshold` legs at each stage, its next-stage pool becomes the
//! following stage's slot price unless that stage is pegged.

use serde::{Deserialize, Serialize};

use crate::constants::{checked_sum, Amount, FIRST_STAGE, MAX_STAGE};
use crate::error::LedgerError;
use crate::profile::RewardProfile;
use crate::reward::{chunk_tranches, joining_bonus, leg_split};
use crate::types::{StageEconomy, TrancheChunk};

/// Projected economics of one stage.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StageProjection {
    pub stage: u32,
    pub slot_price: Amount,
    pub pegged: bool,
    /// Per-unit base times the completion threshold.
    pub inflow: Amount,
    pub mc_per_leg: Amount,
    pub mc_total: Amount,
    pub jb_total: Amount,
    pub nsp_per_leg: Amount,
    pub nsp_total: Amount,
    pub company_side_total: Amount,
    /// Inflow not assigned to any category.
    pub margin_total: Amount,
    pub tranches: Vec<TrancheChunk>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectionTotals {
    pub legs: u64,
    pub inflow: Amount,
    pub mc_paid: Amount,
    pub jb_paid: Amount,
    pub company_side: Amount,
    pub margin: Amount,
}

impl ProjectionTotals {
    fn add(&mut self, stage: &StageProjection, legs: u64) -> Result<(), LedgerError> {
        let add = |acc: Amount, v: Amount| acc.checked_add(v).ok_or(LedgerError::AmountOverflow);
        self.legs += legs;
        self.inflow = add(self.inflow, stage.inflow)?;
        self.mc_paid = add(self.mc_paid, stage.mc_total)?;
        self.jb_paid = add(self.jb_paid, stage.jb_total)?;
        self.company_side = add(self.company_side, stage.company_side_total)?;
        self.margin = add(self.margin, stage.margin_total)?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub profile: String,
    pub stages: Vec<StageProjection>,
    pub totals: ProjectionTotals,
}

fn times(amount: Amount, legs: u64) -> Result<Amount, LedgerError> {
    amount.checked_mul(legs as Amount).ok_or(LedgerError::AmountOverflow)
}

/// Project up to `stages` stages starting from `stage_one_price`.
///
/// Stops early at [`MAX_STAGE`] or when a stage's slot price reaches zero.
pub fn project_stages(
    profile: &RewardProfile,
    stage_one_price: Amount,
    stages: u32,
) -> Result<Projection, LedgerError> {
    let threshold = profile.completion_threshold;
    let last = stages.min(MAX_STAGE);
    let mut out = Vec::with_capacity(last as usize);
    let mut totals = ProjectionTotals::default();
    let mut slot_price = stage_one_price;

    for stage in FIRST_STAGE..=last {
        let pegged_total = profile.pegged_total(stage).filter(|_| stage > FIRST_STAGE);
        if let Some(total) = pegged_total {
            slot_price = total;
        }
        if slot_price == 0 {
            break;
        }

        let economy = StageEconomy {
            stage,
            slot_price,
            completion_threshold: threshold,
            width: profile.width,
            pegged_total,
        };
        let split = leg_split(profile, &economy, slot_price)?;
        let jb_per_buyer = joining_bonus(profile, stage, slot_price)?;
        let legs = threshold as u64;

        let inflow = times(slot_price, legs)?;
        let mc_total = times(split.completion_bonus, legs)?;
        let jb_total = times(jb_per_buyer, legs)?;
        let nsp_total = times(split.next_stage_pool, legs)?;
        let company_side_total = times(split.company_side_total()?, legs)?;
        let margin_total = checked_sum([mc_total, jb_total, nsp_total, company_side_total])
            .and_then(|assigned| inflow.checked_sub(assigned))
            .ok_or(LedgerError::AmountOverflow)?;

        let leg_lines: Vec<(u32, Amount)> = (1..=threshold).map(|l| (l, split.completion_bonus)).collect();

        let projection = StageProjection {
            stage,
            slot_price,
            pegged: pegged_total.is_some(),
            inflow,
            mc_per_leg: split.completion_bonus,
            mc_total,
            jb_total,
            nsp_per_leg: split.next_stage_pool,
            nsp_total,
            company_side_total,
            margin_total,
            tranches: chunk_tranches(&leg_lines, profile.tranche_size)?,
        };
        totals.add(&projection, legs)?;
        out.push(projection);

        slot_price = nsp_total;
    }

    Ok(Projection { profile: profile.name.clone(), stages: out, totals })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::tokens;
    use crate::profile::{PROFILE_FLAT_TWO_LEG, PROFILE_PRINCIPAL_SIXTY_TWO};

    #[test]
    fn stage_two_price_is_stage_one_pool() {
        let p = RewardProfile::named(PROFILE_PRINCIPAL_SIXTY_TWO).unwrap();
        let proj = project_stages(&p, tokens(1_000), 3).unwrap();
        assert_eq!(proj.stages[0].mc_total, tokens(10_044));
        assert_eq!(proj.stages[0].nsp_total, tokens(3_100));
        assert_eq!(proj.stages[1].slot_price, tokens(3_100));
        assert_eq!(proj.stages[1].jb_total, 0);
        assert_eq!(proj.stages[2].slot_price, proj.stages[1].nsp_total);
    }

    #[test]
    fn pegged_stages_override_recurrence() {
        let p = RewardProfile::named(PROFILE_PRINCIPAL_SIXTY_TWO).unwrap();
        let proj = project_stages(&p, tokens(1_000), 10).unwrap();
        assert_eq!(proj.stages.len(), 10);
        let eight = &proj.stages[7];
        assert!(eight.pegged);
        assert_eq!(eight.slot_price, tokens(10_000_000));
        assert_eq!(eight.mc_per_leg, 16_129_032_258_064);
        assert_eq!(proj.stages[9].slot_price, tokens(12_000_000));
        assert!(!proj.stages[6].pegged);
    }

    #[test]
    fn tranches_cover_threshold() {
        let p = RewardProfile::named(PROFILE_PRINCIPAL_SIXTY_TWO).unwrap();
        let proj = project_stages(&p, tokens(1_000), 1).unwrap();
        let tranches = &proj.stages[0].tranches;
        assert_eq!(tranches.len(), 11);
        assert_eq!(tranches.iter().filter(|t| t.complete).count(), 10);
        assert_eq!(tranches[0].amount, tokens(162) * 6);
    }

    #[test]
    fn capped_at_max_stage() {
        let p = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        let proj = project_stages(&p, tokens(1_000_000), 50).unwrap();
        assert!(proj.stages.len() as u32 <= MAX_STAGE);
    }

    #[test]
    fn stops_when_price_vanishes() {
        let p = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        let proj = project_stages(&p, 1, 5).unwrap();
        assert_eq!(proj.stages.len(), 1);
    }

    #[test]
    fn totals_accumulate() {
        let p = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        let proj = project_stages(&p, tokens(1_000), 2).unwrap();
        let mc: Amount = proj.stages.iter().map(|s| s.mc_total).sum();
        assert_eq!(proj.totals.mc_paid, mc);
        assert_eq!(proj.totals.legs, 4);
    }

    #[test]
    fn sixty_two_leg_profile_reaches_max_stage() {
        let p = RewardProfile::named(PROFILE_PRINCIPAL_SIXTY_TWO).unwrap();
        let proj = project_stages(&p, tokens(1_000), MAX_STAGE).unwrap();
        assert_eq!(proj.stages.len() as u32, MAX_STAGE);
        let last = proj.stages.last().unwrap();
        assert!(last.slot_price > u64::MAX as Amount);
        assert_eq!(last.slot_price, proj.stages[18].nsp_total);
    }

    #[test]
    fn overflowing_price_is_reported() {
        let p = RewardProfile::named(PROFILE_FLAT_TWO_LEG).unwrap();
        assert_eq!(project_stages(&p, Amount::MAX, 1), Err(LedgerError::AmountOverflow));
    }
}
