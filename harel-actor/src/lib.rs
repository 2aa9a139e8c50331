//! # harel-actor
//!
//! Async actor runtime for harel.
//!
//! This crate provides:
//! - Actors that run a machine behind a serialized mailbox
//! - Task, callback and nested-machine invocations
//! - Delayed transitions backed by tokio timers
//! - Snapshot subscriptions and microstep inspection
//! - YAML/env configuration

pub mod actor;
pub mod broadcast;
pub mod config;
pub mod error;
mod invoke;
pub mod logic;

pub use actor::Actor;
pub use broadcast::{InspectionEvent, InspectionKind, SnapshotBroadcaster, Subscription};
pub use config::{ActorConfig, Config, ConfigError, LoggingConfig};
pub use error::ActorError;
pub use logic::{ActorLogic, ActorRegistry, CallbackHandle};
