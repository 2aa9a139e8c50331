//! Core error types.

use thiserror::Error;

/// Boxed error returned by user-supplied guards and actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the statechart engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("conflicting transitions: '{first}' and '{second}' exit overlapping states")]
    ConflictingTransitions { first: String, second: String },

    #[error("action '{action}' failed: {reason}")]
    ActionFailed { action: String, reason: String },

    #[error("guard '{guard}' failed: {reason}")]
    GuardFailed { guard: String, reason: String },

    #[error("transitions from '{state}' did not settle after {steps} microsteps")]
    NonTerminating { state: String, steps: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid_definition(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        CoreError::InvalidState {
            reason: reason.into(),
        }
    }

    /// Returns whether this error is a fault of the running actor.
    ///
    /// Faults move the snapshot to `status = error`; every other error is
    /// surfaced to the caller and leaves the previous snapshot current.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            CoreError::ActionFailed { .. }
                | CoreError::GuardFailed { .. }
                | CoreError::NonTerminating { .. }
        )
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "INVALID_DEFINITION",
            CoreError::InvalidGuard { .. } => "INVALID_DEFINITION",
            CoreError::InvalidState { .. } => "INVALID_STATE",
            CoreError::ConflictingTransitions { .. } => "CONFLICTING_TRANSITIONS",
            CoreError::ActionFailed { .. } => "UNHANDLED_EXCEPTION_IN_ACTION",
            CoreError::GuardFailed { .. } => "UNHANDLED_EXCEPTION_IN_ACTION",
            CoreError::NonTerminating { .. } => "NON_TERMINATING_TRANSITION",
            CoreError::Json(_) => "INVALID_DEFINITION",
        }
    }
}
