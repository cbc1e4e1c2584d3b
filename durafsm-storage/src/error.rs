//! Storage error types.

use thiserror::Error;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("instance already exists: {0}")]
    DuplicateIdentity(String),

    #[error("stale record {id}: expected version {expected}, found {actual}")]
    StaleRecord {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("timed out after {waited_ms}ms waiting for lock on {id}")]
    LockTimeout { id: String, waited_ms: u64 },

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("core error: {0}")]
    Core(#[from] durafsm_core::CoreError),
}

impl StorageError {
    /// Returns whether the whole load-apply-commit cycle may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::StaleRecord { .. } | StorageError::LockTimeout { .. }
        )
    }

    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::Io(_) => "IO_ERROR",
            StorageError::Json(_) => "BAD_RECORD",
            StorageError::DuplicateIdentity(_) => "INSTANCE_EXISTS",
            StorageError::StaleRecord { .. } => "CONFLICT",
            StorageError::LockTimeout { .. } => "LOCK_TIMEOUT",
            StorageError::NotFound(_) => "INSTANCE_NOT_FOUND",
            StorageError::Corruption(_) => "CORRUPTION",
            StorageError::Core(e) => e.error_code(),
        }
    }
}
