//! Write batches and the in-memory store.
//!
//! A [`StoreBatch`] carries everything one unit of work changes: position
//! upserts, new ledger entries, frozen economies, receipts, releases,
//! outbox events, peripheral records and balance deltas. Stores apply it
//! whole or not at all.
//!
//! [`MemoryStore`] keeps everything behind one `RwLock` and is used by
//! tests and the offline tools; the node persists to RocksDB.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::constants::Amount;
use crate::error::{BalanceError, LedgerError, StagetreeError, StructuralError};
use crate::traits::{BalanceStore, IdKind, MatrixStore};
use crate::types::{
    EntryId, OutboxEvent, OwnerId, PlacementReceipt, Position, PositionId, ReleaseRecord,
    RewardCategory, RewardEntry, StageEconomy, TimeLock, TimeLockId, TimeLockStatus, Withdrawal,
    WithdrawalId,
};

/// Uniqueness key of a ledger entry.
pub type EntryKey = (PositionId, RewardCategory, u32);

pub fn entry_key(entry: &RewardEntry) -> EntryKey {
    (entry.position, entry.category, entry.leg_index)
}

/// One atomic unit of writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreBatch {
    /// Inserts or replaces, keyed by id.
    pub positions: Vec<Position>,
    pub economies: Vec<(PositionId, StageEconomy)>,
    /// Append-only.
    pub entries: Vec<RewardEntry>,
    pub receipts: Vec<PlacementReceipt>,
    pub releases: Vec<ReleaseRecord>,
    pub outbox: Vec<OutboxEvent>,
    /// Inserts or replaces, keyed by id.
    pub time_locks: Vec<TimeLock>,
    /// Inserts or replaces, keyed by id.
    pub withdrawals: Vec<Withdrawal>,
    pub credits: Vec<(OwnerId, Amount)>,
    pub debits: Vec<(OwnerId, Amount)>,
}

impl StoreBatch {
    pub fn is_empty(&self) -> bool {
        self == &StoreBatch::default()
    }

    pub fn credit(&mut self, owner: OwnerId, amount: Amount) {
        if amount > 0 {
            self.credits.push((owner, amount));
        }
    }

    pub fn debit(&mut self, owner: OwnerId, amount: Amount) {
        if amount > 0 {
            self.debits.push((owner, amount));
        }
    }

    /// Staged position with `id`, latest write wins.
    pub fn staged_position(&self, id: PositionId) -> Option<&Position> {
        self.positions.iter().rev().find(|p| p.id == id)
    }

    /// Resolve the post-commit balance of every owner the batch touches.
    ///
    /// `current` reads the committed balance. Fails if any owner would end
    /// below zero or the arithmetic overflows [`Amount`].
    pub fn resolve_balances<F>(&self, mut current: F) -> Result<Vec<(OwnerId, Amount)>, StagetreeError>
    where
        F: FnMut(OwnerId) -> Result<Amount, StagetreeError>,
    {
        let mut net: BTreeMap<OwnerId, (Amount, Amount)> = BTreeMap::new();
        for (owner, amount) in &self.credits {
            let slot = &mut net.entry(*owner).or_default().0;
            *slot = slot.checked_add(*amount).ok_or(BalanceError::Overflow(owner.get()))?;
        }
        for (owner, amount) in &self.debits {
            let slot = &mut net.entry(*owner).or_default().1;
            *slot = slot.checked_add(*amount).ok_or(BalanceError::Overflow(owner.get()))?;
        }

        let mut resolved = Vec::with_capacity(net.len());
        for (owner, (credit, debit)) in net {
            let have = current(owner)?;
            let gross = have.checked_add(credit).ok_or(BalanceError::Overflow(owner.get()))?;
            let Some(next) = gross.checked_sub(debit) else {
                return Err(BalanceError::Insufficient {
                    owner: owner.get(),
                    have,
                    need: debit - credit,
                }
                .into());
            };
            resolved.push((owner, next));
        }
        Ok(resolved)
    }

    /// Check ledger, receipt and successor uniqueness against committed state.
    pub fn check_uniqueness<E, R, S>(
        &self,
        mut entry_exists: E,
        mut receipt_exists: R,
        mut successor: S,
    ) -> Result<(), StagetreeError>
    where
        E: FnMut(&EntryKey) -> Result<bool, StagetreeError>,
        R: FnMut(&str) -> Result<bool, StagetreeError>,
        S: FnMut(PositionId) -> Result<Option<PositionId>, StagetreeError>,
    {
        let mut keys = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            let key = entry_key(entry);
            if !keys.insert(key) || entry_exists(&key)? {
                return Err(LedgerError::DuplicateEntry {
                    position: entry.position.get(),
                    category: entry.category.to_string(),
                    leg_index: entry.leg_index,
                }
                .into());
            }
        }

        let mut seen_keys = HashSet::with_capacity(self.receipts.len());
        for receipt in &self.receipts {
            if !seen_keys.insert(receipt.idempotency_key.as_str())
                || receipt_exists(&receipt.idempotency_key)?
            {
                return Err(LedgerError::DuplicateReceipt(receipt.idempotency_key.clone()).into());
            }
        }

        let mut spawned = HashMap::new();
        for position in &self.positions {
            let Some(origin) = position.spawned_from else { continue };
            let clash = match spawned.insert(origin, position.id) {
                Some(other) if other != position.id => true,
                _ => matches!(successor(origin)?, Some(existing) if existing != position.id),
            };
            if clash {
                return Err(StructuralError::InvariantViolation {
                    position: origin.get(),
                    detail: "next-stage root already opened".into(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inner {
    positions: HashMap<PositionId, Position>,
    children: HashMap<PositionId, BTreeSet<PositionId>>,
    roots: BTreeMap<(OwnerId, u32), BTreeSet<PositionId>>,
    by_owner: HashMap<OwnerId, BTreeSet<PositionId>>,
    successors: HashMap<PositionId, PositionId>,
    economies: HashMap<PositionId, StageEconomy>,
    entries: BTreeMap<EntryId, RewardEntry>,
    entries_by_position: HashMap<PositionId, Vec<EntryId>>,
    entry_keys: HashSet<EntryKey>,
    receipts: HashMap<String, PlacementReceipt>,
    releases: HashMap<PositionId, Vec<ReleaseRecord>>,
    outbox: Vec<OutboxEvent>,
    time_locks: BTreeMap<TimeLockId, TimeLock>,
    withdrawals: BTreeMap<WithdrawalId, Withdrawal>,
    balances: HashMap<OwnerId, Amount>,
}

impl Inner {
    fn apply(&mut self, batch: StoreBatch, balances: Vec<(OwnerId, Amount)>) {
        for position in batch.positions {
            if let Some(parent) = position.parent {
                self.children.entry(parent).or_default().insert(position.id);
            } else {
                self.roots
                    .entry((position.owner, position.stage))
                    .or_default()
                    .insert(position.id);
            }
            if let Some(origin) = position.spawned_from {
                self.successors.insert(origin, position.id);
            }
            self.by_owner.entry(position.owner).or_default().insert(position.id);
            self.positions.insert(position.id, position);
        }
        for (root, economy) in batch.economies {
            self.economies.insert(root, economy);
        }
        for entry in batch.entries {
            self.entry_keys.insert(entry_key(&entry));
            self.entries_by_position.entry(entry.position).or_default().push(entry.id);
            self.entries.insert(entry.id, entry);
        }
        for receipt in batch.receipts {
            self.receipts.insert(receipt.idempotency_key.clone(), receipt);
        }
        for release in batch.releases {
            self.releases.entry(release.position).or_default().push(release);
        }
        self.outbox.extend(batch.outbox);
        for lock in batch.time_locks {
            self.time_locks.insert(lock.id, lock);
        }
        for withdrawal in batch.withdrawals {
            self.withdrawals.insert(withdrawal.id, withdrawal);
        }
        for (owner, balance) in balances {
            self.balances.insert(owner, balance);
        }
    }
}

/// In-memory [`MatrixStore`] and [`BalanceStore`].
///
/// No persistence. Safe to share across threads.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    positions_seq: AtomicU64,
    entries_seq: AtomicU64,
    locks_seq: AtomicU64,
    withdrawals_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            positions_seq: AtomicU64::new(0),
            entries_seq: AtomicU64::new(0),
            locks_seq: AtomicU64::new(0),
            withdrawals_seq: AtomicU64::new(0),
        }
    }

    fn seq(&self, kind: IdKind) -> &AtomicU64 {
        match kind {
            IdKind::Position => &self.positions_seq,
            IdKind::Entry => &self.entries_seq,
            IdKind::TimeLock => &self.locks_seq,
            IdKind::Withdrawal => &self.withdrawals_seq,
        }
    }

    /// Number of stored positions.
    pub fn position_count(&self) -> usize {
        self.inner.read().positions.len()
    }

    /// Number of stored ledger entries.
    pub fn entry_count(&self) -> usize {
        self.inner.read().entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MatrixStore for MemoryStore {
    fn next_id(&self, kind: IdKind) -> Result<u64, StagetreeError> {
        Ok(self.seq(kind).fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn commit(&self, batch: StoreBatch) -> Result<(), StagetreeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        batch.check_uniqueness(
            |key| Ok(inner.entry_keys.contains(key)),
            |key| Ok(inner.receipts.contains_key(key)),
            |origin| Ok(inner.successors.get(&origin).copied()),
        )?;
        let balances =
            batch.resolve_balances(|owner| Ok(inner.balances.get(&owner).copied().unwrap_or(0)))?;
        inner.apply(batch, balances);
        Ok(())
    }

    fn get_position(&self, id: PositionId) -> Result<Option<Position>, StagetreeError> {
        Ok(self.inner.read().positions.get(&id).cloned())
    }

    fn children_page(
        &self,
        parent: PositionId,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>, StagetreeError> {
        let inner = self.inner.read();
        let Some(children) = inner.children.get(&parent) else {
            return Ok(Vec::new());
        };
        let start = after.map(|a| PositionId(a.get().saturating_add(1))).unwrap_or_default();
        Ok(children
            .range(start..)
            .take(limit)
            .filter_map(|id| inner.positions.get(id).cloned())
            .collect())
    }

    fn child_count(&self, parent: PositionId) -> Result<u32, StagetreeError> {
        Ok(self.inner.read().children.get(&parent).map_or(0, |c| c.len() as u32))
    }

    fn roots_of(&self, owner: OwnerId, stage: u32) -> Result<Vec<PositionId>, StagetreeError> {
        Ok(self
            .inner
            .read()
            .roots
            .get(&(owner, stage))
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default())
    }

    fn positions_of(&self, owner: OwnerId) -> Result<Vec<Position>, StagetreeError> {
        let inner = self.inner.read();
        Ok(inner
            .by_owner
            .get(&owner)
            .map(|ids| ids.iter().filter_map(|id| inner.positions.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn successor_of(&self, position: PositionId) -> Result<Option<PositionId>, StagetreeError> {
        Ok(self.inner.read().successors.get(&position).copied())
    }

    fn economy(&self, root: PositionId) -> Result<Option<StageEconomy>, StagetreeError> {
        Ok(self.inner.read().economies.get(&root).cloned())
    }

    fn entries_for(&self, position: PositionId) -> Result<Vec<RewardEntry>, StagetreeError> {
        let inner = self.inner.read();
        Ok(inner
            .entries_by_position
            .get(&position)
            .map(|ids| ids.iter().filter_map(|id| inner.entries.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    fn receipt(&self, idempotency_key: &str) -> Result<Option<PlacementReceipt>, StagetreeError> {
        Ok(self.inner.read().receipts.get(idempotency_key).cloned())
    }

    fn releases_for(&self, position: PositionId) -> Result<Vec<ReleaseRecord>, StagetreeError> {
        Ok(self.inner.read().releases.get(&position).cloned().unwrap_or_default())
    }

    fn outbox_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, OutboxEvent)>, StagetreeError> {
        let inner = self.inner.read();
        Ok(inner
            .outbox
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u64 + 1, e.clone()))
            .filter(|(seq, _)| *seq > after)
            .take(limit)
            .collect())
    }

    fn time_lock(&self, id: TimeLockId) -> Result<Option<TimeLock>, StagetreeError> {
        Ok(self.inner.read().time_locks.get(&id).cloned())
    }

    fn matured_time_locks(&self, now: u64) -> Result<Vec<TimeLock>, StagetreeError> {
        Ok(self
            .inner
            .read()
            .time_locks
            .values()
            .filter(|l| l.status == TimeLockStatus::Locked && l.is_mature(now))
            .cloned()
            .collect())
    }

    fn withdrawal(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, StagetreeError> {
        Ok(self.inner.read().withdrawals.get(&id).cloned())
    }

    fn withdrawals_of(&self, owner: OwnerId) -> Result<Vec<Withdrawal>, StagetreeError> {
        Ok(self
            .inner
            .read()
            .withdrawals
            .values()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect())
    }
}

impl BalanceStore for MemoryStore {
    fn balance(&self, owner: OwnerId) -> Result<Amount, StagetreeError> {
        Ok(self.inner.read().balances.get(&owner).copied().unwrap_or(0))
    }

    fn credit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let mut batch = StoreBatch::default();
        batch.credit(owner, amount);
        self.commit(batch)?;
        self.balance(owner)
    }

    fn debit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let mut batch = StoreBatch::default();
        batch.debit(owner, amount);
        self.commit(batch)?;
        self.balance(owner)
    }
}
