//! Time-locked deposits and the unlock sweep.
//!
//! `lock_deposit` debits the owner and records a [`TimeLock`]; `sweep`
//! releases every matured lock, paying principal plus reward, one batch per
//! lock. Releases are serialized so a lock is paid at most once even when a
//! manual sweep overlaps the scheduled one.

use std::sync::Arc;

use parking_lot::Mutex;

use stagetree_core::constants::{apply_bps, Amount};
use stagetree_core::error::{BalanceError, LedgerError, StagetreeError, TimeLockError};
use stagetree_core::store::StoreBatch;
use stagetree_core::traits::{IdKind, MatrixStore};
use stagetree_core::types::{OwnerId, TimeLock, TimeLockId, TimeLockStatus};

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: Vec<TimeLockId>,
    /// Principal plus reward credited across all released locks.
    pub total_paid: Amount,
}

/// Time-lock bookkeeping over a shared store.
pub struct TimeLocks<S: MatrixStore + ?Sized> {
    store: Arc<S>,
    period_secs: u64,
    reward_bps: u64,
    release_guard: Mutex<()>,
}

impl<S: MatrixStore + ?Sized> TimeLocks<S> {
    pub fn new(store: Arc<S>, period_secs: u64, reward_bps: u64) -> Self {
        Self { store, period_secs, reward_bps, release_guard: Mutex::new(()) }
    }

    /// Debit `amount` from `owner` and lock it until `now + period`.
    pub fn lock_deposit(&self, owner: OwnerId, amount: Amount, now: u64) -> Result<TimeLock, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let lock = TimeLock {
            id: TimeLockId(self.store.next_id(IdKind::TimeLock)?),
            owner,
            amount,
            reward: apply_bps(amount, self.reward_bps).ok_or(LedgerError::AmountOverflow)?,
            locked_at: now,
            unlock_at: now.saturating_add(self.period_secs),
            status: TimeLockStatus::Locked,
        };
        let mut batch = StoreBatch::default();
        batch.debit(owner, amount);
        batch.time_locks.push(lock.clone());
        self.store.commit(batch)?;

        tracing::info!(lock = %lock.id, owner = %owner, amount, unlock_at = lock.unlock_at, "deposit locked");
        Ok(lock)
    }

    /// Release every lock matured at `now`.
    ///
    /// A failing lock is logged and left for the next pass; the rest still
    /// release.
    pub fn sweep(&self, now: u64) -> Result<SweepReport, StagetreeError> {
        let _guard = self.release_guard.lock();
        let mut report = SweepReport::default();
        for lock in self.store.matured_time_locks(now)? {
            match self.release(lock) {
                Ok((id, paid)) => {
                    report.released.push(id);
                    report.total_paid = report.total_paid.checked_add(paid).ok_or(LedgerError::AmountOverflow)?;
                }
                Err(e) => tracing::error!(error = %e, "time-lock release failed"),
            }
        }
        if !report.released.is_empty() {
            tracing::info!(count = report.released.len(), total_paid = report.total_paid, "unlock sweep");
        }
        Ok(report)
    }

    pub fn get(&self, id: TimeLockId) -> Result<TimeLock, StagetreeError> {
        self.store
            .time_lock(id)?
            .ok_or_else(|| TimeLockError::NotFound(id.get()).into())
    }

    fn release(&self, lock: TimeLock) -> Result<(TimeLockId, Amount), StagetreeError> {
        // Re-read under the guard; the listing may be stale.
        let current = self.get(lock.id)?;
        if current.status == TimeLockStatus::Released {
            return Err(TimeLockError::AlreadyReleased(lock.id.get()).into());
        }
        let paid = current
            .amount
            .checked_add(current.reward)
            .ok_or(LedgerError::AmountOverflow)?;

        let mut batch = StoreBatch::default();
        batch.credit(current.owner, paid);
        batch.time_locks.push(TimeLock { status: TimeLockStatus::Released, ..current.clone() });
        self.store.commit(batch)?;

        tracing::debug!(lock = %current.id, owner = %current.owner, paid, "time lock released");
        Ok((current.id, paid))
    }
}
