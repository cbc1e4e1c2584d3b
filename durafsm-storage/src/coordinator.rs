//! Persistence coordinator.
//!
//! Delimits one load-apply-commit cycle per identity:
//!
//! 1. `begin` loads the record under an exclusive hold, or starts a fresh
//!    record in `Initial` when the identity is unknown.
//! 2. The caller (or `raise`) applies an event to the record.
//! 3. `commit` inserts or version-checks and updates, then releases the hold.
//!    Dropping a transaction without committing discards the changes.

use crate::error::StorageError;
use crate::lock::RowLock;
use crate::store::RecordStore;
use durafsm_core::{ApplyResult, EventEngine, InstanceRecord, MachineDefinition};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// How `raise` treats retryable failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub retry: RetryPolicy,
}

/// Outcome of one successful `raise`.
#[derive(Debug, Clone)]
pub struct RaiseOutcome {
    /// Record as committed.
    pub record: InstanceRecord,
    pub result: ApplyResult,
    /// Whether this call inserted the record.
    pub created: bool,
    pub attempts: u32,
}

/// An open load-for-update scope on one identity.
pub struct Transaction<'a> {
    store: &'a dyn RecordStore,
    record: InstanceRecord,
    existed: bool,
    _lock: RowLock<'a>,
}

impl<'a> Transaction<'a> {
    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut InstanceRecord {
        &mut self.record
    }

    /// Whether the record was already stored when the transaction began.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Persists the record and releases the hold.
    pub fn commit(mut self) -> Result<InstanceRecord, StorageError> {
        let expected = self.record.version;
        self.record.version += 1;

        if self.existed {
            self.store.update(&self.record, expected)?;
        } else {
            self.store.insert(&self.record)?;
        }

        tracing::debug!(
            instance = %self.record.id,
            state = %self.record.state,
            version = self.record.version,
            "committed"
        );
        Ok(self.record)
    }

    /// Releases the hold without persisting anything.
    pub fn abort(self) {
        tracing::debug!(instance = %self.record.id, "aborted");
    }
}

/// Runs event applications against a record store.
pub struct PersistenceCoordinator {
    store: Arc<dyn RecordStore>,
    engine: EventEngine,
    config: CoordinatorConfig,
}

impl PersistenceCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, definition: Arc<MachineDefinition>) -> Self {
        Self::with_config(store, definition, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RecordStore>,
        definition: Arc<MachineDefinition>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            engine: EventEngine::new(definition),
            config,
        }
    }

    pub fn engine(&self) -> &EventEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Loads `id` for update, starting a fresh record if it does not exist.
    pub fn begin(&self, id: &str) -> Result<Transaction<'_>, StorageError> {
        let (stored, lock) = self.store.load_for_update(id)?;
        let existed = stored.is_some();
        let record = stored.unwrap_or_else(|| InstanceRecord::new(id));

        Ok(Transaction {
            store: self.store.as_ref(),
            record,
            existed,
            _lock: lock,
        })
    }

    /// Raises `event` against `id` in its own transaction, retrying
    /// retryable failures as configured.
    pub fn raise(&self, id: &str, event: &str, data: &Value) -> Result<RaiseOutcome, StorageError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.raise_once(id, event, data) {
                Ok((record, result, created)) => {
                    return Ok(RaiseOutcome {
                        record,
                        result,
                        created,
                        attempts: attempt,
                    })
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        instance = id,
                        event,
                        attempt,
                        "retrying after {}",
                        e
                    );
                    std::thread::sleep(self.config.retry.backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn raise_once(
        &self,
        id: &str,
        event: &str,
        data: &Value,
    ) -> Result<(InstanceRecord, ApplyResult, bool), StorageError> {
        let mut tx = self.begin(id)?;
        let result = self.engine.apply(tx.record_mut(), event, data)?;
        let created = !tx.existed();
        let record = tx.commit()?;
        Ok((record, result, created))
    }

    /// Reads a stored record.
    pub fn get(&self, id: &str) -> Result<InstanceRecord, StorageError> {
        self.store
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}
