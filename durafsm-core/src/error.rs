//! Core error types.

use thiserror::Error;

/// Errors from the state machine core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("unknown event: {event}")]
    UnknownEvent { event: String },

    #[error("composite event '{event}' cannot be raised directly")]
    CompositeRaised { event: String },

    #[error("instance is in undeclared state '{state}'")]
    UnknownState { state: String },

    #[error("action failed while handling '{event}' in state '{state}': {reason}")]
    ActionFailed {
        state: String,
        event: String,
        reason: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }

    /// Returns true for errors caused by a programming mistake rather than
    /// the instance's runtime data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::UnknownEvent { .. }
                | CoreError::CompositeRaised { .. }
        )
    }

    /// Returns a stable error code for reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::UnknownEvent { .. } => "UNKNOWN_EVENT",
            CoreError::CompositeRaised { .. } => "COMPOSITE_RAISED",
            CoreError::UnknownState { .. } => "UNKNOWN_STATE",
            CoreError::ActionFailed { .. } => "ACTION_FAILED",
            CoreError::Json(_) => "BAD_REQUEST",
            CoreError::Yaml(_) => "BAD_REQUEST",
        }
    }
}
