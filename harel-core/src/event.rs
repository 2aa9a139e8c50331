//! Events and event descriptors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event passed to the entry actions of the initial configuration.
pub const INIT_EVENT: &str = "harel.init";

/// Prefix of invocation success events.
pub const DONE_INVOKE_PREFIX: &str = "done.invoke.";

/// Prefix of invocation failure events.
pub const ERROR_INVOKE_PREFIX: &str = "error.invoke.";

/// Prefix of state completion events.
pub const DONE_STATE_PREFIX: &str = "done.state.";

/// An event: a type plus an arbitrary flat payload.
///
/// Serializes as `{"type": "...", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
        }
    }

    /// Adds a payload field.
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Parses an event from JSON. A bare string is an event with no payload.
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        match json {
            Value::String(s) => Ok(Event::new(s.as_str())),
            other => serde_json::from_value(other.clone()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Returns the event as a JSON object (including its type).
    pub fn to_value(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert("type".to_string(), Value::String(self.event_type.clone()));
        Value::Object(map)
    }

    pub fn init() -> Self {
        Event::new(INIT_EVENT)
    }

    pub fn done_invoke(id: &str, output: Value) -> Self {
        Event::new(format!("{}{}", DONE_INVOKE_PREFIX, id)).with("output", output)
    }

    pub fn error_invoke(id: &str, error: Value) -> Self {
        Event::new(format!("{}{}", ERROR_INVOKE_PREFIX, id)).with("error", error)
    }

    pub fn done_state(node_id: &str, output: Value) -> Self {
        Event::new(done_state_type(node_id)).with("output", output)
    }

    /// Returns the invocation id if this is a done/error invocation event.
    pub fn invocation_id(&self) -> Option<&str> {
        self.event_type
            .strip_prefix(DONE_INVOKE_PREFIX)
            .or_else(|| self.event_type.strip_prefix(ERROR_INVOKE_PREFIX))
    }
}

impl From<&str> for Event {
    fn from(s: &str) -> Self {
        Event::new(s)
    }
}

impl From<String> for Event {
    fn from(s: String) -> Self {
        Event::new(s)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.event_type)
    }
}

pub(crate) fn done_state_type(node_id: &str) -> String {
    format!("{}{}", DONE_STATE_PREFIX, node_id)
}

pub(crate) fn after_type(delay_key: &str, node_id: &str) -> String {
    format!("harel.after({})#{}", delay_key, node_id)
}

/// Returns true if `descriptor` matches `event_type`.
///
/// `*` matches every event; `a.b.*` matches `a.b` and any event whose
/// dot-separated tokens start with `a.b`.
pub fn matches_descriptor(descriptor: &str, event_type: &str) -> bool {
    if descriptor == event_type || descriptor == "*" {
        return true;
    }
    match descriptor.strip_suffix(".*") {
        Some(prefix) => {
            event_type == prefix
                || (event_type.starts_with(prefix)
                    && event_type.as_bytes().get(prefix.len()) == Some(&b'.'))
        }
        None => false,
    }
}

/// Returns true if the descriptor contains a wildcard.
pub fn is_wildcard(descriptor: &str) -> bool {
    descriptor == "*" || descriptor.ends_with(".*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization() {
        let event = Event::new("PAY").with("amount", json!(100));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, json!({"type": "PAY", "amount": 100}));

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_from_json_string() {
        let event = Event::from_json(&json!("NEXT")).unwrap();
        assert_eq!(event.event_type, "NEXT");
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_system_events() {
        let done = Event::done_invoke("fetch", json!({"id": 1}));
        assert_eq!(done.event_type, "done.invoke.fetch");
        assert_eq!(done.get("output"), Some(&json!({"id": 1})));
        assert_eq!(done.invocation_id(), Some("fetch"));

        let err = Event::error_invoke("fetch", json!("timeout"));
        assert_eq!(err.event_type, "error.invoke.fetch");
        assert_eq!(err.invocation_id(), Some("fetch"));

        assert_eq!(Event::new("PAY").invocation_id(), None);
        assert_eq!(after_type("1000", "light.green"), "harel.after(1000)#light.green");
    }

    #[test]
    fn test_descriptor_matching() {
        assert!(matches_descriptor("PAY", "PAY"));
        assert!(!matches_descriptor("PAY", "PAYMENT"));
        assert!(matches_descriptor("*", "anything"));
        assert!(matches_descriptor("done.invoke.*", "done.invoke.fetch"));
        assert!(matches_descriptor("done.*", "done.invoke.fetch"));
        assert!(matches_descriptor("done.*", "done"));
        assert!(!matches_descriptor("done.*", "doneness"));
        assert!(!matches_descriptor("done.invoke.*", "error.invoke.fetch"));
    }
}
