//! Record store capability and the in-memory backend.

use crate::error::StorageError;
use crate::lock::{LockTable, RowLock};
use dashmap::DashMap;
use durafsm_core::InstanceRecord;
use std::time::Duration;

/// What the coordinator needs from a storage backend.
///
/// `load_for_update` must hand out at most one [`RowLock`] per identity at a
/// time; `update` must refuse a record whose stored version moved on since
/// it was loaded.
pub trait RecordStore: Send + Sync {
    /// Loads a record and holds it exclusively until the returned lock drops.
    fn load_for_update(
        &self,
        id: &str,
    ) -> Result<(Option<InstanceRecord>, RowLock<'_>), StorageError>;

    /// Inserts a new record.
    fn insert(&self, record: &InstanceRecord) -> Result<(), StorageError>;

    /// Replaces a record if the stored version still equals `expected_version`.
    fn update(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), StorageError>;

    /// Reads a record without taking a hold.
    fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StorageError>;
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, InstanceRecord>,
    locks: LockTable,
    lock_timeout: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long `load_for_update` waits for a held identity.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for MemoryStore {
    fn load_for_update(
        &self,
        id: &str,
    ) -> Result<(Option<InstanceRecord>, RowLock<'_>), StorageError> {
        let lock = self.locks.acquire(id, self.lock_timeout)?;
        let record = self.records.get(id).map(|r| r.value().clone());
        Ok((record, lock))
    }

    fn insert(&self, record: &InstanceRecord) -> Result<(), StorageError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateIdentity(record.id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    fn update(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), StorageError> {
        let mut stored = self
            .records
            .get_mut(&record.id)
            .ok_or_else(|| StorageError::NotFound(record.id.clone()))?;

        if stored.version != expected_version {
            return Err(StorageError::StaleRecord {
                id: record.id.clone(),
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = record.clone();
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<InstanceRecord>, StorageError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}
