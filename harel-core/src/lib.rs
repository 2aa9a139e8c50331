//! # harel-core
//!
//! Statechart engine for harel.
//!
//! This crate provides:
//! - Machine definition parsing and validation
//! - The compiled state-node tree and configuration resolution
//! - Transition selection with hierarchy, parallel regions and guards
//! - Run-to-completion microstep/macrostep execution
//! - Guard expression evaluation
//!
//! The engine is synchronous and side-effect free: invocations and timers
//! are described by [`ActorCommand`]s for a runtime to execute.

pub mod action;
pub mod command;
pub mod definition;
pub mod error;
pub mod event;
pub mod guard;
pub mod implementations;
pub mod machine;
pub mod macrostep;
pub mod node;
pub mod resolve;
mod select;
pub mod snapshot;
mod step;
pub mod value;

pub use action::Effect;
pub use command::ActorCommand;
pub use definition::{MachineConfig, StateKind};
pub use error::{BoxError, CoreError};
pub use event::Event;
pub use guard::{GuardEvaluator, GuardExpr};
pub use implementations::Implementations;
pub use machine::{Machine, DEFAULT_MAX_MICROSTEPS};
pub use macrostep::Macrostep;
pub use node::{NodeIndex, StateNode};
pub use snapshot::{ChildRef, ErrorInfo, Snapshot, Status};
pub use value::{StateDescriptor, StateValue};
