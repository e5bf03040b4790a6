//! Ledger constants. All monetary values are in minor units (1 token = 10^8 minor units).

/// A monetary amount in minor units.
///
/// 128 bits: stage prices compound from stage to stage and the upper stages
/// of the 62-leg profile exceed `u64::MAX` minor units.
pub type Amount = u128;

/// Minor units per whole token.
pub const UNIT: Amount = 100_000_000;

/// Basis-point denominator: 10_000 bps == 100%.
pub const BPS_PRECISION: u64 = 10_000;

/// Highest stage a lineage can reach. Completing a position at this stage
/// opens nothing further.
pub const MAX_STAGE: u32 = 20;

/// The stage every lineage starts in.
pub const FIRST_STAGE: u32 = 1;

/// Default number of legs per payable tranche.
pub const DEFAULT_TRANCHE_SIZE: u32 = 6;

/// Default unit base price at stage 1, in minor units (the 1,000-token
/// matrix half of a 2,000-token slot).
pub const DEFAULT_STAGE_ONE_UNIT_BASE: Amount = 1_000 * UNIT;

/// Default time-lock period for the unlock sweep, in days.
pub const DEFAULT_LOCK_PERIOD_DAYS: u64 = 150;

/// Default reward paid on a matured time-lock, in bps of the locked amount.
pub const DEFAULT_LOCK_REWARD_BPS: u64 = 10_000;

/// Seconds per day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Default JSON-RPC port for the daemon.
pub const DEFAULT_RPC_PORT: u16 = 18_440;

/// Default wait for a lineage lock before reporting a conflict, in milliseconds.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;

/// Convert whole tokens to minor units.
pub const fn tokens(whole: u64) -> Amount {
    whole as Amount * UNIT
}

/// Apply a basis-point rate to an amount. Truncates toward zero.
///
/// `None` only when the result itself does not fit, which needs a rate above
/// 100% on an amount near `Amount::MAX`.
pub fn apply_bps(amount: Amount, bps: u64) -> Option<Amount> {
    let precision = BPS_PRECISION as Amount;
    let bps = bps as Amount;
    let whole = (amount / precision).checked_mul(bps)?;
    whole.checked_add((amount % precision) * bps / precision)
}

/// Sum amounts, `None` on overflow.
pub fn checked_sum<I: IntoIterator<Item = Amount>>(amounts: I) -> Option<Amount> {
    amounts.into_iter().try_fold(0 as Amount, |acc, a| acc.checked_add(a))
}
