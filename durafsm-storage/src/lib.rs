//! # durafsm-storage
//!
//! Storage layer for durafsm.
//!
//! This crate provides:
//! - The record store capability with in-memory and file backends
//! - Per-identity row locks
//! - The persistence coordinator running load-apply-commit cycles

pub mod coordinator;
pub mod error;
pub mod file;
pub mod lock;
pub mod store;

pub use coordinator::{
    CoordinatorConfig, PersistenceCoordinator, RaiseOutcome, RetryPolicy, Transaction,
};
pub use error::StorageError;
pub use file::FileStore;
pub use lock::{LockTable, RowLock};
pub use store::{MemoryStore, RecordStore};
