//! Transaction view over a store.
//!
//! Reads see committed state overlaid with everything staged so far; writes
//! only touch the pending [`StoreBatch`]. Dropping a `Txn` discards it.

use std::collections::HashMap;

use stagetree_core::constants::{checked_sum, Amount};
use stagetree_core::error::{LedgerError, StagetreeError, StructuralError};
use stagetree_core::store::StoreBatch;
use stagetree_core::traits::{IdKind, MatrixStore};
use stagetree_core::types::{
    EntryId, OutboxEvent, OwnerId, Position, PositionId, RewardCategory, RewardEntry, StageEconomy,
};

/// Children fetched per store round-trip during traversal.
pub const CHILD_PAGE: usize = 64;

pub struct Txn<'a> {
    store: &'a dyn MatrixStore,
    now: u64,
    positions: HashMap<PositionId, Position>,
    /// Staged children per parent, ascending id.
    new_children: HashMap<PositionId, Vec<PositionId>>,
    successors: HashMap<PositionId, PositionId>,
    economies: HashMap<PositionId, StageEconomy>,
    batch: StoreBatch,
}

impl<'a> Txn<'a> {
    pub fn new(store: &'a dyn MatrixStore, now: u64) -> Self {
        Self {
            store,
            now,
            positions: HashMap::new(),
            new_children: HashMap::new(),
            successors: HashMap::new(),
            economies: HashMap::new(),
            batch: StoreBatch::default(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn next_id(&self, kind: IdKind) -> Result<u64, StagetreeError> {
        self.store.next_id(kind)
    }

    pub fn position(&self, id: PositionId) -> Result<Position, StagetreeError> {
        if let Some(p) = self.positions.get(&id) {
            return Ok(p.clone());
        }
        self.store
            .get_position(id)?
            .ok_or_else(|| StructuralError::PositionNotFound(id.get()).into())
    }

    /// Stage a position insert or update.
    ///
    /// A failed store read aborts the stage; the child indexes would
    /// otherwise miss a new position.
    pub fn put_position(&mut self, position: Position) -> Result<(), StagetreeError> {
        let is_new = !self.positions.contains_key(&position.id)
            && self.store.get_position(position.id)?.is_none();
        if is_new {
            if let Some(parent) = position.parent {
                self.new_children.entry(parent).or_default().push(position.id);
            }
            if let Some(origin) = position.spawned_from {
                self.successors.insert(origin, position.id);
            }
        }
        self.positions.insert(position.id, position);
        Ok(())
    }

    pub fn child_count(&self, parent: PositionId) -> Result<u32, StagetreeError> {
        let staged = self.new_children.get(&parent).map_or(0, Vec::len);
        Ok(self.store.child_count(parent)? + staged as u32)
    }

    /// Every child id of `parent`, ascending, committed ones read page by page.
    pub fn children(&self, parent: PositionId) -> Result<Vec<PositionId>, StagetreeError> {
        let mut out = Vec::new();
        let mut after = None;
        loop {
            let page = self.store.children_page(parent, after, CHILD_PAGE)?;
            let full = page.len() == CHILD_PAGE;
            after = page.last().map(|p| p.id);
            out.extend(page.into_iter().map(|p| p.id));
            if !full {
                break;
            }
        }
        if let Some(staged) = self.new_children.get(&parent) {
            out.extend(staged.iter().copied());
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Lowest-id root of `owner` at `stage`, committed or staged.
    pub fn lowest_root(&self, owner: OwnerId, stage: u32) -> Result<Option<PositionId>, StagetreeError> {
        let committed = self.store.roots_of(owner, stage)?.into_iter().min();
        let staged = self
            .positions
            .values()
            .filter(|p| p.is_root() && p.owner == owner && p.stage == stage)
            .map(|p| p.id)
            .min();
        Ok(match (committed, staged) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    pub fn successor_of(&self, position: PositionId) -> Result<Option<PositionId>, StagetreeError> {
        if let Some(s) = self.successors.get(&position) {
            return Ok(Some(*s));
        }
        self.store.successor_of(position)
    }

    pub fn economy(&self, root: PositionId) -> Result<StageEconomy, StagetreeError> {
        if let Some(e) = self.economies.get(&root) {
            return Ok(e.clone());
        }
        self.store
            .economy(root)?
            .ok_or_else(|| StructuralError::EconomyMissing(root.get()).into())
    }

    pub fn put_economy(&mut self, root: PositionId, economy: StageEconomy) {
        self.economies.insert(root, economy.clone());
        self.batch.economies.push((root, economy));
    }

    /// Append a ledger entry with a freshly allocated id.
    pub fn push_entry(
        &mut self,
        beneficiary: OwnerId,
        position: &Position,
        category: RewardCategory,
        leg_index: u32,
        amount: Amount,
    ) -> Result<EntryId, StagetreeError> {
        let id = EntryId(self.next_id(IdKind::Entry)?);
        self.batch.entries.push(RewardEntry {
            id,
            beneficiary,
            position: position.id,
            category,
            stage: position.stage,
            leg_index,
            amount,
            created_at: self.now,
        });
        Ok(id)
    }

    /// Committed and staged entries on `position`.
    pub fn entries_for(&self, position: PositionId) -> Result<Vec<RewardEntry>, StagetreeError> {
        let mut entries = self.store.entries_for(position)?;
        entries.extend(self.batch.entries.iter().filter(|e| e.position == position).cloned());
        Ok(entries)
    }

    pub fn category_total(&self, position: PositionId, category: RewardCategory) -> Result<Amount, StagetreeError> {
        let entries = self.entries_for(position)?;
        let total = checked_sum(entries.iter().filter(|e| e.category == category).map(|e| e.amount))
            .ok_or(LedgerError::AmountOverflow)?;
        Ok(total)
    }

    pub fn credit(&mut self, owner: OwnerId, amount: Amount) {
        self.batch.credit(owner, amount);
    }

    pub fn push_outbox(&mut self, event: OutboxEvent) {
        self.batch.outbox.push(event);
    }

    pub fn batch_mut(&mut self) -> &mut StoreBatch {
        &mut self.batch
    }

    pub fn staged_entry_ids(&self) -> Vec<EntryId> {
        self.batch.entries.iter().map(|e| e.id).collect()
    }

    /// Hand the staged writes to the store.
    pub fn commit(mut self) -> Result<(), StagetreeError> {
        let mut positions: Vec<Position> = self.positions.into_values().collect();
        positions.sort_unstable_by_key(|p| p.id);
        self.batch.positions = positions;
        self.store.commit(self.batch)
    }
}
