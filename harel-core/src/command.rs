//! Side effects the core hands to the actor runtime.

use crate::event::Event;
use serde_json::Value;
use std::time::Duration;

/// Instruction for the runtime hosting a machine.
///
/// The core never starts tasks or timers itself; each macrostep returns the
/// commands the runtime must execute, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorCommand {
    /// Start invocation `id` running logic `src`.
    Spawn {
        id: String,
        src: String,
        input: Value,
        /// Id of the state node owning the invocation.
        node: String,
    },
    Cancel { id: String },
    /// Deliver `event` back to the machine after `delay`.
    Schedule {
        id: String,
        event: Event,
        delay: Duration,
    },
    Unschedule { id: String },
    SendParent(Event),
    SendTo { id: String, event: Event },
}

impl ActorCommand {
    pub fn id(&self) -> Option<&str> {
        match self {
            ActorCommand::Spawn { id, .. }
            | ActorCommand::Cancel { id }
            | ActorCommand::Schedule { id, .. }
            | ActorCommand::Unschedule { id }
            | ActorCommand::SendTo { id, .. } => Some(id),
            ActorCommand::SendParent(_) => None,
        }
    }
}

/// Drops `Spawn`/`Cancel` and `Schedule`/`Unschedule` pairs for the same id
/// issued within one macrostep (state entered and left again).
pub(crate) fn compact(commands: Vec<ActorCommand>) -> Vec<ActorCommand> {
    let mut out: Vec<Option<ActorCommand>> = Vec::with_capacity(commands.len());
    for command in commands {
        let started = match &command {
            ActorCommand::Cancel { id } => out.iter().rposition(
                |c| matches!(c, Some(ActorCommand::Spawn { id: spawned, .. }) if spawned == id),
            ),
            ActorCommand::Unschedule { id } => out.iter().rposition(
                |c| matches!(c, Some(ActorCommand::Schedule { id: scheduled, .. }) if scheduled == id),
            ),
            _ => None,
        };
        match started {
            Some(pos) => out[pos] = None,
            None => out.push(Some(command)),
        }
    }
    out.into_iter().flatten().collect()
}
