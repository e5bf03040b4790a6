//! Withdrawal workflow.
//!
//! ```text
//! Pending ──► ReadyForManual ──► Completed | Failed
//!    │    ──► ReadyForBank   ──► Completed | Failed
//!    └──────► Completed | Failed
//! ```
//!
//! A request debits the owner immediately. Failing a withdrawal credits the
//! amount back in the same batch as the status change.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use stagetree_core::constants::Amount;
use stagetree_core::error::{BalanceError, StagetreeError, WithdrawalError};
use stagetree_core::store::StoreBatch;
use stagetree_core::traits::{IdKind, MatrixStore};
use stagetree_core::types::{OwnerId, Withdrawal, WithdrawalId, WithdrawalMethod, WithdrawalStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RailError {
    #[error("payout rail disabled")]
    Disabled,
    #[error("payout rejected: {0}")]
    Rejected(String),
}

/// Outbound settlement for token withdrawals.
pub trait PayoutRail: Send + Sync {
    fn name(&self) -> &str;

    /// Send the payout, returning the rail's reference for it.
    fn send(&self, withdrawal: &Withdrawal) -> Result<String, RailError>;
}

/// A rail that refuses every payout, so token withdrawals fall back to the
/// manual queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRail;

impl PayoutRail for DisabledRail {
    fn name(&self) -> &str {
        "disabled"
    }

    fn send(&self, _withdrawal: &Withdrawal) -> Result<String, RailError> {
        Err(RailError::Disabled)
    }
}

/// Whether `from -> to` is an allowed transition.
pub fn can_transition(from: WithdrawalStatus, to: WithdrawalStatus) -> bool {
    use WithdrawalStatus::*;
    matches!(
        (from, to),
        (Pending, ReadyForManual | ReadyForBank | Completed | Failed)
            | (ReadyForManual | ReadyForBank, Completed | Failed)
    )
}

pub struct Withdrawals<S: MatrixStore + ?Sized> {
    store: Arc<S>,
    rail: Box<dyn PayoutRail>,
    live_payouts: bool,
    transition_guard: Mutex<()>,
}

impl<S: MatrixStore + ?Sized> Withdrawals<S> {
    pub fn new(store: Arc<S>, rail: Box<dyn PayoutRail>, live_payouts: bool) -> Self {
        Self { store, rail, live_payouts, transition_guard: Mutex::new(()) }
    }

    /// Debit `amount` and record a pending withdrawal.
    pub fn request(
        &self,
        owner: OwnerId,
        amount: Amount,
        method: WithdrawalMethod,
        now: u64,
    ) -> Result<Withdrawal, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let withdrawal = Withdrawal {
            id: WithdrawalId(self.store.next_id(IdKind::Withdrawal)?),
            owner,
            amount,
            method,
            status: WithdrawalStatus::Pending,
            created_at: now,
            updated_at: now,
            note: None,
        };
        let mut batch = StoreBatch::default();
        batch.debit(owner, amount);
        batch.withdrawals.push(withdrawal.clone());
        self.store.commit(batch)?;

        tracing::info!(withdrawal = %withdrawal.id, owner = %owner, amount, "withdrawal requested");
        Ok(withdrawal)
    }

    /// Route a pending withdrawal.
    ///
    /// Bank withdrawals go to the bank queue. Token withdrawals go through the
    /// payout rail when live payouts are on, and to the manual queue
    /// otherwise or when the rail refuses.
    pub fn execute(&self, id: WithdrawalId, now: u64) -> Result<Withdrawal, StagetreeError> {
        let _guard = self.transition_guard.lock();
        let current = self.get(id)?;
        let (to, note) = match &current.method {
            WithdrawalMethod::Bank { .. } => (WithdrawalStatus::ReadyForBank, None),
            WithdrawalMethod::Token { .. } if self.live_payouts => {
                Self::check(&current, WithdrawalStatus::ReadyForManual)?;
                match self.rail.send(&current) {
                    Ok(reference) => (WithdrawalStatus::Completed, Some(reference)),
                    Err(e) => {
                        tracing::warn!(withdrawal = %id, rail = self.rail.name(), error = %e, "payout rail failed, queued for manual");
                        (WithdrawalStatus::ReadyForManual, Some(e.to_string()))
                    }
                }
            }
            WithdrawalMethod::Token { .. } => (WithdrawalStatus::ReadyForManual, None),
        };
        self.transition(current, to, note, now)
    }

    /// Mark a withdrawal paid out.
    pub fn complete(&self, id: WithdrawalId, reference: Option<String>, now: u64) -> Result<Withdrawal, StagetreeError> {
        let _guard = self.transition_guard.lock();
        let current = self.get(id)?;
        self.transition(current, WithdrawalStatus::Completed, reference, now)
    }

    /// Mark a withdrawal failed and refund the owner.
    pub fn fail(&self, id: WithdrawalId, reason: &str, now: u64) -> Result<Withdrawal, StagetreeError> {
        let _guard = self.transition_guard.lock();
        let current = self.get(id)?;
        self.transition(current, WithdrawalStatus::Failed, Some(reason.to_string()), now)
    }

    pub fn get(&self, id: WithdrawalId) -> Result<Withdrawal, StagetreeError> {
        self.store
            .withdrawal(id)?
            .ok_or_else(|| WithdrawalError::NotFound(id.get()).into())
    }

    pub fn list(&self, owner: OwnerId) -> Result<Vec<Withdrawal>, StagetreeError> {
        self.store.withdrawals_of(owner)
    }

    fn check(current: &Withdrawal, to: WithdrawalStatus) -> Result<(), StagetreeError> {
        if can_transition(current.status, to) {
            Ok(())
        } else {
            Err(WithdrawalError::InvalidTransition {
                id: current.id.get(),
                from: current.status.to_string(),
                to: to.to_string(),
            }
            .into())
        }
    }

    fn transition(
        &self,
        current: Withdrawal,
        to: WithdrawalStatus,
        note: Option<String>,
        now: u64,
    ) -> Result<Withdrawal, StagetreeError> {
        Self::check(&current, to)?;
        let from = current.status;
        let next = Withdrawal { status: to, updated_at: now, note: note.or(current.note.clone()), ..current };

        let mut batch = StoreBatch::default();
        if to == WithdrawalStatus::Failed {
            batch.credit(next.owner, next.amount);
        }
        batch.withdrawals.push(next.clone());
        self.store.commit(batch)?;

        tracing::info!(withdrawal = %next.id, %from, %to, "withdrawal transition");
        Ok(next)
    }
}
