//! Reward profiles: the configurable economics of the matrix.
//!
//! The historical ledgers disagree on every constant (completion bonus 15%
//! vs 16.2%, next-stage pool 35% vs 5%, completion after 2, 10 or 62 legs).
//! Each variant is a named, mutually exclusive [`RewardProfile`]; an
//! integrator picks exactly one and there is no default.
//!
//! | profile | width | depth | threshold | MC | JB | NSP | CR | LP | CP |
//! |---|---|---|---|---|---|---|---|---|---|
//! | `flat-two-leg` | 2 | 1 | 2 | 15% | 10% | 35% | 20% | 10% | 10% |
//! | `ten-leg` | 2 | 3 | 10 | 15% | 10% | 35% | 20% | 10% | 10% |
//! | `principal-sixty-two` | 2 | 5 | 62 | 16.2% | 10% | 5% | 20% | 10% | 10% |
//!
//! `principal-sixty-two` pegs stages 8, 9 and 10 to 10M, 11M and 12M tokens.

use serde::{Deserialize, Serialize};

use crate::constants::{tokens, Amount, BPS_PRECISION, DEFAULT_TRANCHE_SIZE, FIRST_STAGE, MAX_STAGE};
use crate::error::ConfigError;
use crate::types::RewardCategory;

pub const PROFILE_FLAT_TWO_LEG: &str = "flat-two-leg";
pub const PROFILE_TEN_LEG: &str = "ten-leg";
pub const PROFILE_PRINCIPAL_SIXTY_TWO: &str = "principal-sixty-two";
pub const PROFILE_CUSTOM: &str = "custom";

/// Every built-in profile name.
pub const BUILTIN_PROFILES: &[&str] =
    &[PROFILE_FLAT_TWO_LEG, PROFILE_TEN_LEG, PROFILE_PRINCIPAL_SIXTY_TWO];

/// Per-leg category rates in basis points of the per-unit base.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CategorySplit {
    pub completion_bonus_bps: u64,
    pub joining_bonus_bps: u64,
    pub next_stage_pool_bps: u64,
    pub company_reserve_bps: u64,
    pub liquidity_pool_bps: u64,
    pub company_profit_bps: u64,
}

impl CategorySplit {
    /// The split in effect at `stage`. Above stage 1 the joining bonus
    /// folds into the liquidity pool.
    pub fn for_stage(&self, stage: u32) -> CategorySplit {
        if stage <= FIRST_STAGE {
            return *self;
        }
        CategorySplit {
            joining_bonus_bps: 0,
            liquidity_pool_bps: self.liquidity_pool_bps.saturating_add(self.joining_bonus_bps),
            ..*self
        }
    }

    pub fn bps(&self, category: RewardCategory) -> u64 {
        match category {
            RewardCategory::CompletionBonus => self.completion_bonus_bps,
            RewardCategory::JoiningBonus => self.joining_bonus_bps,
            RewardCategory::NextStagePool => self.next_stage_pool_bps,
            RewardCategory::CompanyReserve => self.company_reserve_bps,
            RewardCategory::LiquidityPool => self.liquidity_pool_bps,
            RewardCategory::CompanyProfit => self.company_profit_bps,
        }
    }

    pub fn total_bps(&self) -> u64 {
        RewardCategory::ALL
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(self.bps(*c)))
    }

    /// Bps left over as implicit company margin.
    pub fn margin_bps(&self) -> u64 {
        BPS_PRECISION.saturating_sub(self.total_bps())
    }
}

/// A stage whose reward pool is replaced by a fixed total.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeggedStage {
    pub stage: u32,
    /// Pegged total in minor units. `None` is a configuration error.
    #[serde(default, with = "crate::amount_serde::option")]
    pub total: Option<Amount>,
}

/// The complete, validated economics used by the engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RewardProfile {
    pub name: String,
    /// Maximum children per position.
    pub width: u32,
    /// How many ancestor levels one placement credits.
    pub credit_depth: u32,
    /// Legs at which a position completes.
    pub completion_threshold: u32,
    /// Legs per payable tranche.
    pub tranche_size: u32,
    pub split: CategorySplit,
    pub pegged: Vec<PeggedStage>,
}

impl RewardProfile {
    /// Look up a built-in profile by name.
    pub fn named(name: &str) -> Result<Self, ConfigError> {
        let legacy_split = CategorySplit {
            completion_bonus_bps: 1_500,
            joining_bonus_bps: 1_000,
            next_stage_pool_bps: 3_500,
            company_reserve_bps: 2_000,
            liquidity_pool_bps: 1_000,
            company_profit_bps: 1_000,
        };
        match name {
            PROFILE_FLAT_TWO_LEG => Ok(Self {
                name: name.to_string(),
                width: 2,
                credit_depth: 1,
                completion_threshold: 2,
                tranche_size: DEFAULT_TRANCHE_SIZE,
                split: legacy_split,
                pegged: Vec::new(),
            }),
            PROFILE_TEN_LEG => Ok(Self {
                name: name.to_string(),
                width: 2,
                credit_depth: 3,
                completion_threshold: 10,
                tranche_size: DEFAULT_TRANCHE_SIZE,
                split: legacy_split,
                pegged: Vec::new(),
            }),
            PROFILE_PRINCIPAL_SIXTY_TWO => Ok(Self {
                name: name.to_string(),
                width: 2,
                credit_depth: 5,
                completion_threshold: 62,
                tranche_size: DEFAULT_TRANCHE_SIZE,
                split: CategorySplit {
                    completion_bonus_bps: 1_620,
                    joining_bonus_bps: 1_000,
                    next_stage_pool_bps: 500,
                    company_reserve_bps: 2_000,
                    liquidity_pool_bps: 1_000,
                    company_profit_bps: 1_000,
                },
                pegged: vec![
                    PeggedStage { stage: 8, total: Some(tokens(10_000_000)) },
                    PeggedStage { stage: 9, total: Some(tokens(11_000_000)) },
                    PeggedStage { stage: 10, total: Some(tokens(12_000_000)) },
                ],
            }),
            PROFILE_CUSTOM => Err(ConfigError::InvalidField {
                field: "profile",
                reason: "custom profiles must supply every field".into(),
            }),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }

    /// Number of positions a root can hold within `credit_depth` levels.
    pub fn matrix_capacity(&self) -> u64 {
        let mut capacity: u64 = 0;
        let mut level: u64 = 1;
        for _ in 0..self.credit_depth {
            level = level.saturating_mul(self.width as u64);
            capacity = capacity.saturating_add(level);
        }
        capacity
    }

    /// Pegged total for `stage`, if the stage is pegged.
    pub fn pegged_total(&self, stage: u32) -> Option<Amount> {
        self.pegged
            .iter()
            .find(|p| p.stage == stage)
            .and_then(|p| p.total)
    }

    /// Check the profile is sound. Called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(invalid("width", "must be at least 1"));
        }
        if self.credit_depth == 0 {
            return Err(invalid("credit_depth", "must be at least 1"));
        }
        if self.tranche_size == 0 {
            return Err(invalid("tranche_size", "must be at least 1"));
        }
        if self.completion_threshold == 0 {
            return Err(invalid("completion_threshold", "must be at least 1"));
        }

        let capacity = self.matrix_capacity();
        if self.completion_threshold as u64 > capacity {
            return Err(ConfigError::UnreachableThreshold {
                threshold: self.completion_threshold,
                width: self.width,
                depth: self.credit_depth,
                capacity,
            });
        }

        for stage in [FIRST_STAGE, FIRST_STAGE + 1] {
            let total_bps = self.split.for_stage(stage).total_bps();
            if total_bps > BPS_PRECISION {
                return Err(ConfigError::SplitOverflow { stage, total_bps });
            }
        }

        let mut seen = Vec::with_capacity(self.pegged.len());
        for pegged in &self.pegged {
            if pegged.stage <= FIRST_STAGE || pegged.stage > MAX_STAGE {
                return Err(ConfigError::PeggedStageOutOfRange(pegged.stage));
            }
            match pegged.total {
                None | Some(0) => return Err(ConfigError::MissingPeggedEntry(pegged.stage)),
                Some(_) => {}
            }
            if seen.contains(&pegged.stage) {
                return Err(invalid("pegged", &format!("stage {} listed twice", pegged.stage)));
            }
            seen.push(pegged.stage);
        }

        Ok(())
    }

    /// Check that every stage price and ledger total from `stage_one_price`
    /// up to [`MAX_STAGE`] is representable.
    pub fn validate_recurrence(&self, stage_one_price: Amount) -> Result<(), ConfigError> {
        crate::simulation::project_stages(self, stage_one_price, MAX_STAGE)
            .map(|_| ())
            .map_err(|_| invalid("stage_one_unit_base", "stage amounts overflow before the last stage"))
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidField { field, reason: reason.to_string() }
}
