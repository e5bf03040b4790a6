//! Process-wide lock table.
//!
//! Locks are keyed by owner and by stage-tree root and always taken in that
//! order. A wait longer than the table's timeout is reported as
//! [`EngineError::ConcurrencyConflict`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use stagetree_core::error::{EngineError, StagetreeError};
use stagetree_core::types::{OwnerId, PositionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockKey {
    Owner(OwnerId),
    /// Every position in a stage tree lives under this root.
    Tree(PositionId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(o) => write!(f, "{o}"),
            Self::Tree(r) => write!(f, "tree {r}"),
        }
    }
}

pub struct LockTable {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self { slots: DashMap::new(), timeout }
    }

    fn slot(&self, key: LockKey) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.entry(key).or_default().value())
    }

    /// Run `f` while holding every lock in `keys`, acquired left to right.
    pub fn hold<T, F>(&self, keys: &[LockKey], f: F) -> Result<T, StagetreeError>
    where
        F: FnOnce() -> Result<T, StagetreeError>,
    {
        let Some((first, rest)) = keys.split_first() else {
            return f();
        };
        let slot = self.slot(*first);
        let _guard = slot.try_lock_for(self.timeout).ok_or_else(|| {
            tracing::debug!(key = %first, timeout_ms = self.timeout.as_millis() as u64, "lock wait timed out");
            EngineError::ConcurrencyConflict(first.to_string())
        })?;
        self.hold(rest, f)
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("keys", &self.slots.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    #[test]
    fn hold_runs_closure() {
        let table = LockTable::new(Duration::from_millis(50));
        let out = table
            .hold(&[LockKey::Owner(OwnerId(1)), LockKey::Tree(PositionId(2))], || Ok(7))
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn empty_key_list_runs_unlocked() {
        let table = LockTable::new(Duration::from_millis(50));
        assert_eq!(table.hold(&[], || Ok(1)).unwrap(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn contended_lock_times_out_as_conflict() {
        let table = Arc::new(LockTable::new(Duration::from_millis(20)));
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                table
                    .hold(&[LockKey::Owner(OwnerId(1))], || {
                        held_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held_rx.recv().unwrap();
        let err = table.hold(&[LockKey::Owner(OwnerId(1))], || Ok(())).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("owner#1"));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(table.hold(&[LockKey::Owner(OwnerId(1))], || Ok(())).is_ok());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let table = LockTable::new(Duration::from_millis(20));
        let out = table.hold(&[LockKey::Owner(OwnerId(1))], || {
            table.hold(&[LockKey::Owner(OwnerId(2))], || Ok(3))
        });
        assert_eq!(out.unwrap(), 3);
    }

    #[test]
    fn serializes_critical_sections() {
        let table = Arc::new(LockTable::new(Duration::from_secs(5)));
        let inside = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        table
                            .hold(&[LockKey::Tree(PositionId(1))], || {
                                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
