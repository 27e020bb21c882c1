//! In-process durable store stand-in.
//!
//! Keeps the same key order as `RocksStore` so FIFO behaviour is identical.
//! Used by tests and by hosts that accept losing the queue on exit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::record::record_key;
use super::{DurableStore, EntityKind, PendingWrite, StoreError};

#[derive(Default)]
struct Tables {
    pending: BTreeMap<[u8; 9], PendingWrite>,
    dead_letter: BTreeMap<[u8; 9], PendingWrite>,
    last_sequence: Option<u64>,
}

/// Memory-backed [`DurableStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

impl DurableStore for MemoryStore {
    fn append(&self, write: &PendingWrite) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        tables.pending.insert(write.key(), write.clone());
        tables.last_sequence = Some(tables.last_sequence.map_or(write.id, |s| s.max(write.id)));
        Ok(())
    }

    fn update(&self, write: &PendingWrite) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        match tables.pending.get_mut(&write.key()) {
            Some(existing) => {
                *existing = write.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: write.entity_kind,
                id: write.id,
            }),
        }
    }

    fn remove(&self, kind: EntityKind, id: u64) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables()?.pending.remove(&record_key(kind, id));
        Ok(())
    }

    fn pending(&self, kind: EntityKind) -> Result<Vec<PendingWrite>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .pending
            .range(record_key(kind, 0)..=record_key(kind, u64::MAX))
            .map(|(_, w)| w.clone())
            .collect())
    }

    fn quarantine(&self, write: &PendingWrite) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        tables.pending.remove(&write.key());
        tables.dead_letter.insert(write.key(), write.clone());
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<PendingWrite>, StoreError> {
        Ok(self.tables()?.dead_letter.values().cloned().collect())
    }

    fn remove_dead_letter(&self, kind: EntityKind, id: u64) -> Result<Option<PendingWrite>, StoreError> {
        self.check_writable()?;
        Ok(self.tables()?.dead_letter.remove(&record_key(kind, id)))
    }

    fn requeue(&self, dead: &PendingWrite, fresh: &PendingWrite) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables()?;
        tables.dead_letter.remove(&dead.key());
        tables.pending.insert(fresh.key(), fresh.clone());
        tables.last_sequence = Some(tables.last_sequence.map_or(fresh.id, |s| s.max(fresh.id)));
        Ok(())
    }

    fn last_sequence(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.tables()?.last_sequence)
    }
}
