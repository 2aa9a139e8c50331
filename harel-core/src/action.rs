//! Actions and the effects they produce.

use crate::definition::{ActionConfig, EventConfig};
use crate::error::CoreError;
use crate::event::Event;
use crate::implementations::Implementations;
use serde_json::{Map, Value};

/// What an action asks the engine to do. Actions never mutate state
/// directly; the microstep applies their effects in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Shallow-merge fields into the context.
    Assign(Map<String, Value>),
    /// Append an event to the internal queue.
    Raise(Event),
    /// Deliver an event to the parent actor, if any.
    SendParent(Event),
    /// Deliver an event to a running invocation.
    SendTo { id: String, event: Event },
    /// Mark the machine done with an optional output.
    Done(Option<Value>),
}

impl Effect {
    /// Assigns a single context field.
    pub fn assign(key: impl Into<String>, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(key.into(), value);
        Effect::Assign(map)
    }

    pub fn raise(event: impl Into<Event>) -> Self {
        Effect::Raise(event.into())
    }
}

/// A compiled action.
#[derive(Debug, Clone)]
pub enum Action {
    Named(String),
    Raise(Event),
    Assign(Map<String, Value>),
    Log(String),
    SendParent(Event),
}

impl Action {
    pub(crate) fn compile(
        config: &ActionConfig,
        implementations: &Implementations,
    ) -> Result<Self, CoreError> {
        Ok(match config {
            ActionConfig::Named(name) => {
                if !implementations.has_action(name) {
                    return Err(CoreError::invalid_definition(format!(
                        "action '{}' is not implemented",
                        name
                    )));
                }
                Action::Named(name.clone())
            }
            ActionConfig::Raise { raise } => Action::Raise(compile_event(raise)?),
            ActionConfig::Assign { assign } => Action::Assign(assign.clone()),
            ActionConfig::Log { log } => Action::Log(log.clone()),
            ActionConfig::SendParent { send_parent } => {
                Action::SendParent(compile_event(send_parent)?)
            }
        })
    }

    /// Short label recorded in the snapshot's action history.
    pub fn label(&self) -> String {
        match self {
            Action::Named(name) => name.clone(),
            Action::Raise(event) => format!("raise({})", event.event_type),
            Action::Assign(_) => "assign".to_string(),
            Action::Log(_) => "log".to_string(),
            Action::SendParent(event) => format!("sendParent({})", event.event_type),
        }
    }

    /// Runs the action. Errors from named actions become
    /// [`CoreError::ActionFailed`].
    pub(crate) fn execute(
        &self,
        implementations: &Implementations,
        machine_id: &str,
        ctx: &Value,
        event: &Event,
    ) -> Result<Vec<Effect>, CoreError> {
        match self {
            Action::Named(name) => {
                implementations
                    .call_action(name, ctx, event)
                    .map_err(|e| CoreError::ActionFailed {
                        action: name.clone(),
                        reason: e.to_string(),
                    })
            }
            Action::Raise(raised) => Ok(vec![Effect::Raise(raised.clone())]),
            Action::Assign(fields) => Ok(vec![Effect::Assign(fields.clone())]),
            Action::Log(message) => {
                tracing::info!(machine = machine_id, event = %event, "{}", message);
                Ok(Vec::new())
            }
            Action::SendParent(sent) => Ok(vec![Effect::SendParent(sent.clone())]),
        }
    }
}

fn compile_event(config: &EventConfig) -> Result<Event, CoreError> {
    let event = match config {
        EventConfig::Type(event_type) => Event::new(event_type.as_str()),
        EventConfig::Event(event) => event.clone(),
    };
    if event.event_type.is_empty() {
        return Err(CoreError::invalid_definition("event type must not be empty"));
    }
    Ok(event)
}

/// Merges fields into the context. A non-object context is replaced by an
/// object holding just the merged fields.
pub(crate) fn merge_ctx(ctx: &Value, fields: &Map<String, Value>) -> Value {
    let mut result = match ctx {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (k, v) in fields {
        result.insert(k.clone(), v.clone());
    }
    Value::Object(result)
}
