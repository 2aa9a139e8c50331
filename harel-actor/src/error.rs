//! Actor error types.

use crate::config::ConfigError;
use harel_core::CoreError;
use thiserror::Error;

/// Actor runtime errors.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("actor '{0}' has not been started")]
    NotStarted(String),

    #[error("actor '{0}' has already been started")]
    AlreadyStarted(String),

    #[error("actor '{0}' stopped")]
    Stopped(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ActorError {
    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            ActorError::Core(e) => e.error_code(),
            ActorError::NotStarted(_) => "ACTOR_NOT_STARTED",
            ActorError::AlreadyStarted(_) => "ACTOR_ALREADY_STARTED",
            ActorError::Stopped(_) => "ACTOR_STOPPED",
            ActorError::Config(_) => "INVALID_CONFIG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err: ActorError = CoreError::NonTerminating {
            state: "loop".to_string(),
            steps: 1000,
        }
        .into();
        assert_eq!(err.error_code(), "NON_TERMINATING_TRANSITION");
        assert_eq!(
            ActorError::Stopped("light".to_string()).to_string(),
            "actor 'light' stopped"
        );
    }
}
