//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HAREL_CONFIG or --config)
//! 3. Environment variables

use harel_core::DEFAULT_MAX_MICROSTEPS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Actor configuration.
    pub actor: ActorConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`Config::load`], reading `path` instead of `HAREL_CONFIG` when given.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("HAREL_CONFIG") {
                Ok(path) => Self::from_file(&path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.actor.apply_env_overrides();
        self.logging.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.actor.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Per-actor settings, inherited by nested machine children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Cap on microsteps within one macrostep.
    pub max_microsteps: usize,
    /// Buffered snapshots per channel subscriber before it lags.
    pub subscriber_capacity: usize,
    /// Publish every intermediate microstep to inspectors.
    pub trace_microsteps: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            subscriber_capacity: 256,
            trace_microsteps: false,
        }
    }
}

impl ActorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(steps) = std::env::var("HAREL_MAX_MICROSTEPS") {
            if let Ok(n) = steps.parse() {
                self.max_microsteps = n;
            }
        }

        if let Ok(capacity) = std::env::var("HAREL_SUBSCRIBER_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.subscriber_capacity = n;
            }
        }

        if let Ok(trace) = std::env::var("HAREL_TRACE_MICROSTEPS") {
            self.trace_microsteps = trace == "1" || trace.to_lowercase() == "true";
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_microsteps == 0 {
            return Err(ConfigError::ValidationError(
                "actor.max_microsteps must be greater than zero".to_string(),
            ));
        }
        if self.subscriber_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "actor.subscriber_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `harel_core=trace`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("HAREL_LOG") {
            if !level.is_empty() {
                self.level = level;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
