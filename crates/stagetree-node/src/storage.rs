//! RocksDB-backed persistent matrix storage.
//!
//! Implements [`MatrixStore`] and [`BalanceStore`] using one column family
//! per record kind plus ordered index families. Index keys are big-endian so
//! lexicographic order is numeric order:
//!
//! | family | key | value |
//! |---|---|---|
//! | `positions` | `id` | [`Position`] |
//! | `children` | `parent ‖ child` | empty |
//! | `roots` | `owner ‖ stage ‖ root` | empty |
//! | `owner_positions` | `owner ‖ id` | empty |
//! | `successors` | `completed` | successor id |
//! | `entries` | `id` | [`RewardEntry`] |
//! | `position_entries` | `position ‖ entry` | empty |
//! | `entry_keys` | `position ‖ category ‖ leg` | entry id |
//! | `balances` | `owner` | little-endian u128 |
//! | `meta` | name | little-endian u64 |
//!
//! Every [`StoreBatch`] is checked and written as one [`WriteBatch`] under a
//! commit mutex, so uniqueness checks and balance read-modify-write never race.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use stagetree_core::constants::Amount;
use stagetree_core::error::{BalanceError, StagetreeError};
use stagetree_core::store::{EntryKey, StoreBatch};
use stagetree_core::traits::{BalanceStore, IdKind, MatrixStore};
use stagetree_core::types::{
    OutboxEvent, OwnerId, PlacementReceipt, Position, PositionId, ReleaseRecord, RewardEntry,
    StageEconomy, TimeLock, TimeLockId, TimeLockStatus, Withdrawal, WithdrawalId,
};

// --- Column family names ---

const CF_POSITIONS: &str = "positions";
const CF_CHILDREN: &str = "children";
const CF_ROOTS: &str = "roots";
const CF_OWNER_POSITIONS: &str = "owner_positions";
const CF_SUCCESSORS: &str = "successors";
const CF_ECONOMIES: &str = "economies";
const CF_ENTRIES: &str = "entries";
const CF_POSITION_ENTRIES: &str = "position_entries";
const CF_ENTRY_KEYS: &str = "entry_keys";
const CF_RECEIPTS: &str = "receipts";
const CF_RELEASES: &str = "releases";
const CF_OUTBOX: &str = "outbox";
const CF_TIME_LOCKS: &str = "time_locks";
const CF_WITHDRAWALS: &str = "withdrawals";
const CF_BALANCES: &str = "balances";
const CF_META: &str = "meta";

const META_OUTBOX_WATERMARK: &[u8] = b"outbox_watermark";

/// All column family names.
const ALL_CFS: &[&str] = &[
    CF_POSITIONS,
    CF_CHILDREN,
    CF_ROOTS,
    CF_OWNER_POSITIONS,
    CF_SUCCESSORS,
    CF_ECONOMIES,
    CF_ENTRIES,
    CF_POSITION_ENTRIES,
    CF_ENTRY_KEYS,
    CF_RECEIPTS,
    CF_RELEASES,
    CF_OUTBOX,
    CF_TIME_LOCKS,
    CF_WITHDRAWALS,
    CF_BALANCES,
    CF_META,
];

fn storage_err(e: impl std::fmt::Display) -> StagetreeError {
    StagetreeError::Storage(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StagetreeError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(storage_err)
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StagetreeError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(storage_err)
}

fn be(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_be_bytes());
    key[8..].copy_from_slice(&b.to_be_bytes());
    key
}

fn root_key(owner: OwnerId, stage: u32, root: PositionId) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..8].copy_from_slice(&owner.get().to_be_bytes());
    key[8..12].copy_from_slice(&stage.to_be_bytes());
    key[12..].copy_from_slice(&root.get().to_be_bytes());
    key
}

fn entry_key_bytes(key: &EntryKey) -> [u8; 13] {
    let (position, category, leg) = key;
    let mut out = [0u8; 13];
    out[..8].copy_from_slice(&position.get().to_be_bytes());
    out[8] = category.tag();
    out[9..].copy_from_slice(&leg.to_be_bytes());
    out
}

/// Trailing big-endian u64 of an index key.
fn trailing_id(key: &[u8]) -> Result<u64, StagetreeError> {
    let tail: [u8; 8] = key
        .len()
        .checked_sub(8)
        .and_then(|start| key[start..].try_into().ok())
        .ok_or_else(|| storage_err("index key too short"))?;
    Ok(u64::from_be_bytes(tail))
}

fn read_u64(bytes: &[u8]) -> Result<u64, StagetreeError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| storage_err("invalid u64 value length"))?;
    Ok(u64::from_le_bytes(arr))
}

fn read_amount(bytes: &[u8]) -> Result<Amount, StagetreeError> {
    let arr: [u8; 16] = bytes.try_into().map_err(|_| storage_err("invalid balance value length"))?;
    Ok(Amount::from_le_bytes(arr))
}

/// RocksDB-backed [`MatrixStore`] and [`BalanceStore`].
pub struct RocksStore {
    db: DB,
    commit_lock: Mutex<()>,
    positions_seq: AtomicU64,
    entries_seq: AtomicU64,
    locks_seq: AtomicU64,
    withdrawals_seq: AtomicU64,
    outbox_seq: AtomicU64,
}

impl RocksStore {
    /// Open or create a database at `path`.
    ///
    /// Creates missing column families and seeds the id sequences from the
    /// highest stored key of each family.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StagetreeError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(storage_err)?;

        let store = Self {
            db,
            commit_lock: Mutex::new(()),
            positions_seq: AtomicU64::new(0),
            entries_seq: AtomicU64::new(0),
            locks_seq: AtomicU64::new(0),
            withdrawals_seq: AtomicU64::new(0),
            outbox_seq: AtomicU64::new(0),
        };
        store.positions_seq.store(store.last_id(CF_POSITIONS)?, Ordering::SeqCst);
        store.entries_seq.store(store.last_id(CF_ENTRIES)?, Ordering::SeqCst);
        store.locks_seq.store(store.last_id(CF_TIME_LOCKS)?, Ordering::SeqCst);
        store.withdrawals_seq.store(store.last_id(CF_WITHDRAWALS)?, Ordering::SeqCst);
        store.outbox_seq.store(store.last_id(CF_OUTBOX)?, Ordering::SeqCst);

        tracing::info!(
            path = %path.as_ref().display(),
            positions = store.positions_seq.load(Ordering::SeqCst),
            entries = store.entries_seq.load(Ordering::SeqCst),
            "store opened"
        );
        Ok(store)
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StagetreeError> {
        self.db.flush().map_err(storage_err)
    }

    /// Highest outbox sequence already handed to the reporter.
    pub fn outbox_watermark(&self) -> Result<u64, StagetreeError> {
        match self.get(CF_META, META_OUTBOX_WATERMARK)? {
            Some(bytes) => read_u64(&bytes),
            None => Ok(0),
        }
    }

    /// Record `seq` as reported. The watermark never moves backwards.
    pub fn set_outbox_watermark(&self, seq: u64) -> Result<(), StagetreeError> {
        let _guard = self.commit_lock.lock();
        if seq <= self.outbox_watermark()? {
            return Ok(());
        }
        let cf = self.cf_handle(CF_META)?;
        self.db.put_cf(cf, META_OUTBOX_WATERMARK, seq.to_le_bytes()).map_err(storage_err)
    }

    /// Trigger manual compaction across all column families.
    pub fn compact(&self) -> Result<(), StagetreeError> {
        for cf_name in ALL_CFS {
            let cf = self.cf_handle(cf_name)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    // --- Internal helpers ---

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StagetreeError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| storage_err(format!("missing column family: {name}")))
    }

    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StagetreeError> {
        let cf = self.cf_handle(cf)?;
        self.db.get_cf(cf, key).map_err(storage_err)
    }

    fn get_decoded<T: bincode::Decode<()>>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StagetreeError> {
        self.get(cf, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    fn last_id(&self, cf: &str) -> Result<u64, StagetreeError> {
        let handle = self.cf_handle(cf)?;
        match self.db.iterator_cf(handle, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item.map_err(storage_err)?;
                trailing_id(&key)
            }
            None => Ok(0),
        }
    }

    /// Keys of `cf` starting with `prefix`, from `start` onward.
    fn scan_prefix(
        &self,
        cf: &str,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StagetreeError> {
        let handle = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::From(start, Direction::Forward)) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn all_values<T: bincode::Decode<()>>(&self, cf: &str) -> Result<Vec<T>, StagetreeError> {
        let handle = self.cf_handle(cf)?;
        self.db
            .iterator_cf(handle, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(storage_err)?;
                decode(&value)
            })
            .collect()
    }

    fn balance_of(&self, owner: OwnerId) -> Result<Amount, StagetreeError> {
        match self.get(CF_BALANCES, &be(owner.get()))? {
            Some(bytes) => read_amount(&bytes),
            None => Ok(0),
        }
    }

    fn write_batch(&self, batch: StoreBatch, balances: Vec<(OwnerId, Amount)>) -> Result<(), StagetreeError> {
        let mut wb = WriteBatch::default();

        for position in &batch.positions {
            let id = position.id.get();
            wb.put_cf(self.cf_handle(CF_POSITIONS)?, be(id), encode(position)?);
            wb.put_cf(self.cf_handle(CF_OWNER_POSITIONS)?, pair_key(position.owner.get(), id), []);
            match position.parent {
                Some(parent) => wb.put_cf(self.cf_handle(CF_CHILDREN)?, pair_key(parent.get(), id), []),
                None => wb.put_cf(
                    self.cf_handle(CF_ROOTS)?,
                    root_key(position.owner, position.stage, position.id),
                    [],
                ),
            }
            if let Some(origin) = position.spawned_from {
                wb.put_cf(self.cf_handle(CF_SUCCESSORS)?, be(origin.get()), be(id));
            }
        }
        for (root, economy) in &batch.economies {
            wb.put_cf(self.cf_handle(CF_ECONOMIES)?, be(root.get()), encode(economy)?);
        }
        for entry in &batch.entries {
            let id = entry.id.get();
            wb.put_cf(self.cf_handle(CF_ENTRIES)?, be(id), encode(entry)?);
            wb.put_cf(self.cf_handle(CF_POSITION_ENTRIES)?, pair_key(entry.position.get(), id), []);
            wb.put_cf(
                self.cf_handle(CF_ENTRY_KEYS)?,
                entry_key_bytes(&stagetree_core::store::entry_key(entry)),
                be(id),
            );
        }
        for receipt in &batch.receipts {
            wb.put_cf(self.cf_handle(CF_RECEIPTS)?, receipt.idempotency_key.as_bytes(), encode(receipt)?);
        }
        for release in &batch.releases {
            wb.put_cf(
                self.cf_handle(CF_RELEASES)?,
                pair_key(release.position.get(), release.released_through.get()),
                encode(release)?,
            );
        }
        for event in &batch.outbox {
            let seq = self.outbox_seq.fetch_add(1, Ordering::SeqCst) + 1;
            wb.put_cf(self.cf_handle(CF_OUTBOX)?, be(seq), encode(event)?);
        }
        for lock in &batch.time_locks {
            wb.put_cf(self.cf_handle(CF_TIME_LOCKS)?, be(lock.id.get()), encode(lock)?);
        }
        for withdrawal in &batch.withdrawals {
            wb.put_cf(self.cf_handle(CF_WITHDRAWALS)?, be(withdrawal.id.get()), encode(withdrawal)?);
        }
        for (owner, balance) in balances {
            wb.put_cf(self.cf_handle(CF_BALANCES)?, be(owner.get()), balance.to_le_bytes());
        }

        self.db.write(wb).map_err(storage_err)
    }
}

impl MatrixStore for RocksStore {
    fn next_id(&self, kind: IdKind) -> Result<u64, StagetreeError> {
        let seq = match kind {
            IdKind::Position => &self.positions_seq,
            IdKind::Entry => &self.entries_seq,
            IdKind::TimeLock => &self.locks_seq,
            IdKind::Withdrawal => &self.withdrawals_seq,
        };
        Ok(seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn commit(&self, batch: StoreBatch) -> Result<(), StagetreeError> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.commit_lock.lock();
        batch.check_uniqueness(
            |key| Ok(self.get(CF_ENTRY_KEYS, &entry_key_bytes(key))?.is_some()),
            |key| Ok(self.get(CF_RECEIPTS, key.as_bytes())?.is_some()),
            |origin| self.successor_of(origin),
        )?;
        let balances = batch.resolve_balances(|owner| self.balance_of(owner))?;
        self.write_batch(batch, balances)
    }

    fn get_position(&self, id: PositionId) -> Result<Option<Position>, StagetreeError> {
        self.get_decoded(CF_POSITIONS, &be(id.get()))
    }

    fn children_page(
        &self,
        parent: PositionId,
        after: Option<PositionId>,
        limit: usize,
    ) -> Result<Vec<Position>, StagetreeError> {
        let prefix = be(parent.get());
        let start = pair_key(parent.get(), after.map_or(0, |a| a.get().saturating_add(1)));
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(CF_CHILDREN, &prefix, &start, limit)? {
            let child = PositionId(trailing_id(&key)?);
            if let Some(position) = self.get_position(child)? {
                out.push(position);
            }
        }
        Ok(out)
    }

    fn child_count(&self, parent: PositionId) -> Result<u32, StagetreeError> {
        let prefix = be(parent.get());
        Ok(self.scan_prefix(CF_CHILDREN, &prefix, &prefix, usize::MAX)?.len() as u32)
    }

    fn roots_of(&self, owner: OwnerId, stage: u32) -> Result<Vec<PositionId>, StagetreeError> {
        let mut prefix = [0u8; 12];
        prefix[..8].copy_from_slice(&owner.get().to_be_bytes());
        prefix[8..].copy_from_slice(&stage.to_be_bytes());
        self.scan_prefix(CF_ROOTS, &prefix, &prefix, usize::MAX)?
            .iter()
            .map(|(key, _)| trailing_id(key).map(PositionId))
            .collect()
    }

    fn positions_of(&self, owner: OwnerId) -> Result<Vec<Position>, StagetreeError> {
        let prefix = be(owner.get());
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(CF_OWNER_POSITIONS, &prefix, &prefix, usize::MAX)? {
            if let Some(position) = self.get_position(PositionId(trailing_id(&key)?))? {
                out.push(position);
            }
        }
        Ok(out)
    }

    fn successor_of(&self, position: PositionId) -> Result<Option<PositionId>, StagetreeError> {
        self.get(CF_SUCCESSORS, &be(position.get()))?
            .map(|bytes| trailing_id(&bytes).map(PositionId))
            .transpose()
    }

    fn economy(&self, root: PositionId) -> Result<Option<StageEconomy>, StagetreeError> {
        self.get_decoded(CF_ECONOMIES, &be(root.get()))
    }

    fn entries_for(&self, position: PositionId) -> Result<Vec<RewardEntry>, StagetreeError> {
        let prefix = be(position.get());
        let mut out = Vec::new();
        for (key, _) in self.scan_prefix(CF_POSITION_ENTRIES, &prefix, &prefix, usize::MAX)? {
            if let Some(entry) = self.get_decoded(CF_ENTRIES, &be(trailing_id(&key)?))? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn receipt(&self, idempotency_key: &str) -> Result<Option<PlacementReceipt>, StagetreeError> {
        self.get_decoded(CF_RECEIPTS, idempotency_key.as_bytes())
    }

    fn releases_for(&self, position: PositionId) -> Result<Vec<ReleaseRecord>, StagetreeError> {
        let prefix = be(position.get());
        self.scan_prefix(CF_RELEASES, &prefix, &prefix, usize::MAX)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    fn outbox_after(&self, after: u64, limit: usize) -> Result<Vec<(u64, OutboxEvent)>, StagetreeError> {
        let handle = self.cf_handle(CF_OUTBOX)?;
        let start = be(after.saturating_add(1));
        self.db
            .iterator_cf(handle, IteratorMode::From(&start, Direction::Forward))
            .take(limit)
            .map(|item| {
                let (key, value) = item.map_err(storage_err)?;
                Ok((trailing_id(&key)?, decode(&value)?))
            })
            .collect()
    }

    fn time_lock(&self, id: TimeLockId) -> Result<Option<TimeLock>, StagetreeError> {
        self.get_decoded(CF_TIME_LOCKS, &be(id.get()))
    }

    fn matured_time_locks(&self, now: u64) -> Result<Vec<TimeLock>, StagetreeError> {
        Ok(self
            .all_values::<TimeLock>(CF_TIME_LOCKS)?
            .into_iter()
            .filter(|l| l.status == TimeLockStatus::Locked && l.is_mature(now))
            .collect())
    }

    fn withdrawal(&self, id: WithdrawalId) -> Result<Option<Withdrawal>, StagetreeError> {
        self.get_decoded(CF_WITHDRAWALS, &be(id.get()))
    }

    fn withdrawals_of(&self, owner: OwnerId) -> Result<Vec<Withdrawal>, StagetreeError> {
        Ok(self
            .all_values::<Withdrawal>(CF_WITHDRAWALS)?
            .into_iter()
            .filter(|w| w.owner == owner)
            .collect())
    }
}

impl BalanceStore for RocksStore {
    fn balance(&self, owner: OwnerId) -> Result<Amount, StagetreeError> {
        self.balance_of(owner)
    }

    fn credit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let mut batch = StoreBatch::default();
        batch.credit(owner, amount);
        self.commit(batch)?;
        self.balance_of(owner)
    }

    fn debit(&self, owner: OwnerId, amount: Amount) -> Result<Amount, StagetreeError> {
        if amount == 0 {
            return Err(BalanceError::ZeroAmount.into());
        }
        let mut batch = StoreBatch::default();
        batch.debit(owner, amount);
        self.commit(batch)?;
        self.balance_of(owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagetree_core::error::{LedgerError, StructuralError};
    use stagetree_core::types::{EntryId, RewardCategory};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn temp_store() -> (RocksStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path().join("matrix")).unwrap();
        (store, dir)
    }

    fn entry(id: u64, position: u64, category: RewardCategory, leg: u32, amount: Amount) -> RewardEntry {
        RewardEntry {
            id: EntryId(id),
            beneficiary: OwnerId(1),
            position: PositionId(position),
            category,
            stage: 1,
            leg_index: leg,
            amount,
            created_at: 0,
        }
    }

    fn small_tree(store: &RocksStore) {
        let root = Position::new_root(PositionId(1), OwnerId(1), 1, None, 0);
        let a = Position::new_child(PositionId(2), OwnerId(1), &root, 0);
        let b = Position::new_child(PositionId(3), OwnerId(1), &root, 0);
        let economy = StageEconomy {
            stage: 1,
            slot_price: 100,
            completion_threshold: 2,
            width: 2,
            pegged_total: None,
        };
        store
            .commit(StoreBatch {
                positions: vec![root, b, a],
                economies: vec![(PositionId(1), economy)],
                ..Default::default()
            })
            .unwrap();
    }

    // ------------------------------------------------------------------
    // Positions and indexes
    // ------------------------------------------------------------------

    #[test]
    fn position_roundtrip() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        let root = store.get_position(PositionId(1)).unwrap().unwrap();
        assert!(root.is_root());
        assert!(store.get_position(PositionId(9)).unwrap().is_none());
        assert_eq!(store.economy(PositionId(1)).unwrap().unwrap().width, 2);
    }

    #[test]
    fn children_index_is_ordered_and_paged() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        let ids: Vec<PositionId> =
            store.children_page(PositionId(1), None, 10).unwrap().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PositionId(2), PositionId(3)]);
        let page = store.children_page(PositionId(1), Some(PositionId(2)), 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, PositionId(3));
        assert_eq!(store.child_count(PositionId(1)).unwrap(), 2);
        assert_eq!(store.child_count(PositionId(2)).unwrap(), 0);
    }

    #[test]
    fn children_prefix_does_not_bleed_into_next_parent() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        let parent = store.get_position(PositionId(2)).unwrap().unwrap();
        let grandchild = Position::new_child(PositionId(4), OwnerId(1), &parent, 0);
        store.commit(StoreBatch { positions: vec![grandchild], ..Default::default() }).unwrap();
        assert_eq!(store.child_count(PositionId(1)).unwrap(), 2);
        assert_eq!(store.child_count(PositionId(2)).unwrap(), 1);
    }

    #[test]
    fn roots_and_owner_index() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        let mut next = Position::new_root(PositionId(5), OwnerId(1), 2, Some(PositionId(1)), 0);
        next.spawned_from = Some(PositionId(1));
        store.commit(StoreBatch { positions: vec![next], ..Default::default() }).unwrap();

        assert_eq!(store.roots_of(OwnerId(1), 1).unwrap(), vec![PositionId(1)]);
        assert_eq!(store.roots_of(OwnerId(1), 2).unwrap(), vec![PositionId(5)]);
        assert!(store.roots_of(OwnerId(2), 1).unwrap().is_empty());
        assert_eq!(store.positions_of(OwnerId(1)).unwrap().len(), 4);
        assert_eq!(store.successor_of(PositionId(1)).unwrap(), Some(PositionId(5)));
    }

    #[test]
    fn second_successor_rejected() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        let mut first = Position::new_root(PositionId(5), OwnerId(1), 2, None, 0);
        first.spawned_from = Some(PositionId(1));
        store.commit(StoreBatch { positions: vec![first], ..Default::default() }).unwrap();
        let mut second = Position::new_root(PositionId(6), OwnerId(1), 2, None, 0);
        second.spawned_from = Some(PositionId(1));
        let err = store.commit(StoreBatch { positions: vec![second], ..Default::default() }).unwrap_err();
        assert!(matches!(err, StagetreeError::Structural(StructuralError::InvariantViolation { .. })));
    }

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    #[test]
    fn entries_by_position_in_id_order() {
        let (store, _dir) = temp_store();
        store
            .commit(StoreBatch {
                entries: vec![
                    entry(2, 1, RewardCategory::NextStagePool, 1, 5),
                    entry(1, 1, RewardCategory::CompletionBonus, 1, 10),
                    entry(3, 2, RewardCategory::CompletionBonus, 1, 10),
                ],
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<EntryId> = store.entries_for(PositionId(1)).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![EntryId(1), EntryId(2)]);
        assert_eq!(store.category_total(PositionId(1), RewardCategory::CompletionBonus).unwrap(), 10);
    }

    #[test]
    fn duplicate_entry_rejected_atomically() {
        let (store, _dir) = temp_store();
        store
            .commit(StoreBatch {
                entries: vec![entry(1, 1, RewardCategory::CompletionBonus, 1, 10)],
                ..Default::default()
            })
            .unwrap();
        let mut batch = StoreBatch {
            entries: vec![entry(2, 1, RewardCategory::CompletionBonus, 1, 10)],
            ..Default::default()
        };
        batch.credit(OwnerId(1), 10);
        let err = store.commit(batch).unwrap_err();
        assert!(matches!(err, StagetreeError::Ledger(LedgerError::DuplicateEntry { .. })));
        assert_eq!(store.balance(OwnerId(1)).unwrap(), 0);
        assert_eq!(store.entries_for(PositionId(1)).unwrap().len(), 1);
    }

    #[test]
    fn releases_and_pending() {
        let (store, _dir) = temp_store();
        store
            .commit(StoreBatch {
                entries: vec![
                    entry(1, 1, RewardCategory::CompanyReserve, 1, 20),
                    entry(2, 1, RewardCategory::CompanyProfit, 1, 10),
                ],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.pending_release(PositionId(1)).unwrap().amount, 30);
        store
            .commit(StoreBatch {
                releases: vec![ReleaseRecord {
                    position: PositionId(1),
                    beneficiary: OwnerId(0),
                    amount: 30,
                    released_through: EntryId(2),
                    created_at: 0,
                }],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.pending_release(PositionId(1)).unwrap().amount, 0);
        assert_eq!(store.releases_for(PositionId(1)).unwrap().len(), 1);
    }

    #[test]
    fn receipts_roundtrip_and_reject_duplicates() {
        let (store, _dir) = temp_store();
        let receipt = PlacementReceipt {
            idempotency_key: "order-17".into(),
            position: PositionId(3),
            entries: vec![EntryId(1), EntryId(2)],
            completed: vec![],
            opened_roots: vec![],
            created_at: 9,
        };
        store.commit(StoreBatch { receipts: vec![receipt.clone()], ..Default::default() }).unwrap();
        assert_eq!(store.receipt("order-17").unwrap(), Some(receipt.clone()));
        assert!(store.receipt("order-18").unwrap().is_none());
        assert!(store.commit(StoreBatch { receipts: vec![receipt], ..Default::default() }).is_err());
    }

    // ------------------------------------------------------------------
    // Balances, sequences and persistence
    // ------------------------------------------------------------------

    #[test]
    fn balances_never_go_negative() {
        let (store, _dir) = temp_store();
        assert_eq!(store.credit(OwnerId(4), 50).unwrap(), 50);
        assert!(matches!(
            store.debit(OwnerId(4), 51),
            Err(StagetreeError::Balance(BalanceError::Insufficient { .. }))
        ));
        assert_eq!(store.debit(OwnerId(4), 50).unwrap(), 0);
    }

    #[test]
    fn sequences_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix");
        {
            let store = RocksStore::open(&path).unwrap();
            small_tree(&store);
            store
                .commit(StoreBatch {
                    entries: vec![entry(7, 1, RewardCategory::CompletionBonus, 1, 10)],
                    outbox: vec![OutboxEvent::InvariantViolation { position: PositionId(1), detail: "x".into() }],
                    ..Default::default()
                })
                .unwrap();
            store.credit(OwnerId(1), 42).unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.next_id(IdKind::Position).unwrap(), 4);
        assert_eq!(store.next_id(IdKind::Entry).unwrap(), 8);
        assert_eq!(store.next_id(IdKind::Withdrawal).unwrap(), 1);
        assert_eq!(store.balance(OwnerId(1)).unwrap(), 42);
        assert_eq!(store.outbox_after(0, 10).unwrap().len(), 1);

        store
            .commit(StoreBatch {
                outbox: vec![OutboxEvent::InvariantViolation { position: PositionId(2), detail: "y".into() }],
                ..Default::default()
            })
            .unwrap();
        let events = store.outbox_after(1, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, 2);
    }

    #[test]
    fn balances_above_u64_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix");
        let wide = u64::MAX as Amount * 3;
        {
            let store = RocksStore::open(&path).unwrap();
            store.credit(OwnerId(1), wide).unwrap();
            store.credit(OwnerId(1), 7).unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.balance(OwnerId(1)).unwrap(), wide + 7);
    }

    #[test]
    fn outbox_watermark_persists_and_only_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix");
        {
            let store = RocksStore::open(&path).unwrap();
            assert_eq!(store.outbox_watermark().unwrap(), 0);
            store.set_outbox_watermark(5).unwrap();
            store.set_outbox_watermark(3).unwrap();
            assert_eq!(store.outbox_watermark().unwrap(), 5);
            store.flush().unwrap();
        }
        let store = RocksStore::open(&path).unwrap();
        assert_eq!(store.outbox_watermark().unwrap(), 5);
    }

    #[test]
    fn time_locks_and_withdrawals_persist() {
        let (store, _dir) = temp_store();
        let lock = TimeLock {
            id: TimeLockId(1),
            owner: OwnerId(1),
            amount: 10,
            reward: 10,
            locked_at: 0,
            unlock_at: 100,
            status: TimeLockStatus::Locked,
        };
        let withdrawal = Withdrawal {
            id: WithdrawalId(1),
            owner: OwnerId(1),
            amount: 5,
            method: stagetree_core::types::WithdrawalMethod::Bank { reference: "acct-1".into() },
            status: stagetree_core::types::WithdrawalStatus::Pending,
            created_at: 0,
            updated_at: 0,
            note: None,
        };
        store
            .commit(StoreBatch {
                time_locks: vec![lock.clone()],
                withdrawals: vec![withdrawal.clone()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.time_lock(TimeLockId(1)).unwrap(), Some(lock));
        assert!(store.matured_time_locks(99).unwrap().is_empty());
        assert_eq!(store.matured_time_locks(100).unwrap().len(), 1);
        assert_eq!(store.withdrawal(WithdrawalId(1)).unwrap(), Some(withdrawal));
        assert_eq!(store.withdrawals_of(OwnerId(1)).unwrap().len(), 1);
        assert!(store.withdrawals_of(OwnerId(2)).unwrap().is_empty());
    }

    #[test]
    fn compact_and_flush_succeed() {
        let (store, _dir) = temp_store();
        small_tree(&store);
        store.flush().unwrap();
        store.compact().unwrap();
    }
}
