//! Store contracts shared by the engine and the node.
//!
//! - [`MatrixStore`]: positions, the reward ledger, receipts and the
//!   peripheral records, written through one atomic [`StoreBatch`].
//! - [`BalanceStore`]: per-owner token balances. Debits never go negative.
//!
//! [`MemoryStore`](crate::store::MemoryStore) implements both for tests;
//! the node ships a RocksDB implementation.

use crate::constants::{checked_sum, Amount};
use crate::error::{LedgerError, StagetreeError};
use crate::store::StoreBatch;
use crate::types::{
    EntryId, OutboxEvent, OwnerId, PlacementReceipt, Position, PositionId, ReleaseRecord,
    RewardCategory, RewardEntry, StageEconomy, TimeLock, TimeLockId, Withdrawal, WithdrawalId,
};

/// Identifier sequences allocated by a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Position,
    Entry,
    TimeLock,
    Withdrawal,
}

impl IdKind {
    pub const ALL: [IdKind; 4] = [Self::Position, Self::Entry, Self::TimeLock, Self::Withdrawal];
}

/// Company-side ledger total not yet covered by a [`ReleaseRecord`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingRelease {
    pub amount: Amount,
    /// Highest unreleased company-side entry, if any.
    pub through: Option<EntryId>,
}

/// Durable storage for the matrix and its ledger.
///
/// Reads are point-in-time. Every mutation goes through [`commit`](Self::commit),
/// which applies a whole batch or nothing.
pub trait MatrixStore: Send + Sync {
    /// Allocate the next identifier of `kind`. Identifiers ascend in
    /// allocation order; an aborted batch leaves a gap.
    fn next_id(&self, kind: IdKind) -> Result<u64, StagetreeError>;

    /// Apply a batch atomically.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::DuplicateEntry`](crate::error::LedgerError::DuplicateEntry)
    ///   if an entry repeats `(position, category, leg_index)`
    /// - [`LedgerError::DuplicateReceipt`](crate::error::LedgerError::DuplicateReceipt)
    ///   if the idempotency key is already recorded
    /// - [`BalanceError::Insufficient`](crate::error::BalanceError::Insufficient)
    ///   if a net debit would take a balance negative
    /// - [`StructuralError::InvariantViolation`](crate::error::StructuralError::InvariantViolation)
    ///   if a position already has a next-stage successor
    fn commit(&self, batch: StoreBatch) -> Result<(), StagetreeError>;

    fn get_position(&self, id: PositionId) -> Result<Option<Position>, StagetreeError>;

    /// Children of `parent` in ascending id order, starting after `after`.
    fn children_page(
        &self,
        parent: PositionId,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>, StagetreeError>;

    fn child_count(&self, parent: PositionId) -> Result<u32, StagetreeError>;

    /// Stage roots owned by `owner` at `stage`, ascending.
    fn roots_of(&self, owner: OwnerId, stage: u32) -> Result<Vec<PositionId>, StagetreeError>;

    /// Every position owned by `owner`, ascending id.
    fn positions_of(&self, owner: OwnerId) -> Result<Vec<Position>, StagetreeError>;

    /// The next-stage root opened by `position`'s completion.
    fn successor_of(&self, position: PositionId) -> Result<Option<PositionId>, StagetreeError>;

    /// Frozen economy of a stage root.
    fn economy(&self, root: PositionId) -> Result<Option<StageEconomy>, StagetreeError>;

    /// Ledger entries on `position`, ascending id.
    fn entries_for(&self, position: PositionId) -> Result<Vec<RewardEntry>, StagetreeError>;

    fn receipt(&self, idempotency_key: &str) -> Result<Option<PlacementReceipt>, StagetreeError>;

    fn releases_for(&self, position: PositionId) -> Result<Vec<ReleaseRecord>, StagetreeError>;

    /// Outbox events with sequence number greater than `after`.
    fn outbox_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, OutboxEvent)>, StagetreeError>;

    fn time_lock(&self, id: TimeLockId) -> Result<Option<TimeLock>, StagetreeError>;

    /// Locked time-locks with `unlock_at <= now`, ascending id.
    fn matured_time_locks(&self, now: u64) -> Result<Vec<TimeLock>, StagetreeError>;

    fn withdrawal(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, StagetreeError>;

    fn withdrawals_of(&self, owner: OwnerId) -> Result<Vec<Withdrawal>, StagetreeError>;

    /// Sum of `category` entries on `position`.
    fn category_total(&self, position: PositionId, category: RewardCategory) -> Result<Amount, StagetreeError> {
        let entries = self.entries_for(position)?;
        let total = checked_sum(entries.iter().filter(|e| e.category == category).map(|e| e.amount))
            .ok_or(LedgerError::AmountOverflow)?;
        Ok(total)
    }

    /// Company-side entries on `position` above the last release watermark.
    fn pending_release(&self, position: PositionId) -> Result<PendingRelease, StagetreeError> {
        let watermark = self
            .releases_for(position)?
            .iter()
            .map(|r| r.released_through)
            .max();
        let mut pending = PendingRelease::default();
        for entry in self.entries_for(position)? {
            if !entry.category.is_company_side() || Some(entry.id) <= watermark {
                continue;
            }
            pending.amount = pending.amount.checked_add(entry.amount).ok_or(LedgerError::AmountOverflow)?;
            pending.through = Some(entry.id);
        }
        Ok(pending)
    }
}

/// Durable per-owner balances.
pub trait BalanceStore: Send + Sync {
    /// Current balance; zero for unknown owners.
    fn balance(&self, owner: OwnerId) -> Result<Amount, StagetreeError>;

    /// Add `amount`, returning the new balance.
    fn credit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError>;

    /// Remove `amount`, returning the new balance.
    ///
    /// # Errors
    ///
    /// [`BalanceError::Insufficient`](crate::error::BalanceError::Insufficient)
    /// if the balance is below `amount`.
    fn debit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{Position, RewardEntry};

    fn entry(id: u64, category: RewardCategory, leg: u32, amount: Amount) -> RewardEntry {
        RewardEntry {
            id: EntryId(id),
            beneficiary: OwnerId(1),
            position: PositionId(1),
            category,
            stage: 1,
            leg_index: leg,
            amount,
            created_at: 0,
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut batch = StoreBatch::default();
        batch.positions.push(Position::new_root(PositionId(1), OwnerId(1), 1, None, 0));
        batch.entries.push(entry(1, RewardCategory::CompletionBonus, 1, 100));
        batch.entries.push(entry(2, RewardCategory::CompanyReserve, 1, 20));
        batch.entries.push(entry(3, RewardCategory::CompanyProfit, 1, 10));
        batch.entries.push(entry(4, RewardCategory::CompletionBonus, 2, 100));
        batch.entries.push(entry(5, RewardCategory::CompanyReserve, 2, 20));
        store.commit(batch).unwrap();
        store
    }

    #[test]
    fn category_total_sums_one_category() {
        let store = seeded();
        assert_eq!(store.category_total(PositionId(1), RewardCategory::CompletionBonus).unwrap(), 200);
        assert_eq!(store.category_total(PositionId(1), RewardCategory::NextStagePool).unwrap(), 0);
    }

    #[test]
    fn pending_release_respects_watermark() {
        let store = seeded();
        let pending = store.pending_release(PositionId(1)).unwrap();
        assert_eq!(pending, PendingRelease { amount: 50, through: Some(EntryId(5)) });

        let mut batch = StoreBatch::default();
        batch.releases.push(ReleaseRecord {
            position: PositionId(1),
            beneficiary: OwnerId(9),
            amount: 30,
            released_through: EntryId(3),
            created_at: 0,
        });
        store.commit(batch).unwrap();

        let pending = store.pending_release(PositionId(1)).unwrap();
        assert_eq!(pending, PendingRelease { amount: 20, through: Some(EntryId(5)) });
    }

    #[test]
    fn overflowing_totals_are_errors() {
        let store = MemoryStore::new();
        let mut batch = StoreBatch::default();
        batch.entries.push(entry(1, RewardCategory::CompletionBonus, 1, Amount::MAX));
        batch.entries.push(entry(2, RewardCategory::CompletionBonus, 2, 1));
        batch.entries.push(entry(3, RewardCategory::CompanyReserve, 1, Amount::MAX));
        batch.entries.push(entry(4, RewardCategory::CompanyProfit, 1, 1));
        store.commit(batch).unwrap();

        assert!(matches!(
            store.category_total(PositionId(1), RewardCategory::CompletionBonus),
            Err(StagetreeError::Ledger(LedgerError::AmountOverflow))
        ));
        assert!(matches!(
            store.pending_release(PositionId(1)),
            Err(StagetreeError::Ledger(LedgerError::AmountOverflow))
        ));
    }

    #[test]
    fn pending_release_empty_position() {
        let store = MemoryStore::new();
        assert_eq!(store.pending_release(PositionId(7)).unwrap(), PendingRelease::default());
    }
}
