//! Snapshots: the externally visible state of a running machine.

use crate::event::Event;
use crate::value::StateValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Done,
    Error,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Active => "active",
            Status::Done => "done",
            Status::Error => "error",
            Status::Stopped => "stopped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault attached to a snapshot with `status = error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// A live invocation owned by an active state node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub id: String,
    pub src: String,
    pub state_node: String,
}

/// Immutable view of a machine after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub machine_id: String,
    pub value: StateValue,
    pub context: Value,
    pub status: Status,

    /// Labels of the actions run by the last step.
    #[serde(default)]
    pub history_actions: Vec<String>,

    /// Raised events not yet processed. Empty once a macrostep settles.
    #[serde(default)]
    pub internal_queue: Vec<Event>,

    #[serde(default)]
    pub children: BTreeMap<String, ChildRef>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    /// Whether the step that produced this snapshot changed the value or
    /// context, or ran any action.
    #[serde(default)]
    pub changed: bool,
}

impl Snapshot {
    /// Returns true if the current value matches a (possibly partial) value
    /// or path, e.g. `"red"` or `"red.walk"`.
    pub fn matches(&self, descriptor: impl Into<StateValue>) -> bool {
        self.value.matches(&descriptor.into())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }

    /// Returns true once the machine can no longer process events.
    pub fn is_terminal(&self) -> bool {
        self.status != Status::Active
    }

    pub fn child(&self, id: &str) -> Option<&ChildRef> {
        self.children.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> Snapshot {
        Snapshot {
            machine_id: "light".to_string(),
            value: serde_json::from_value(json!({"red": "walk"})).unwrap(),
            context: json!({"cycles": 2}),
            status: Status::Active,
            history_actions: vec!["assign".to_string()],
            internal_queue: Vec::new(),
            children: BTreeMap::new(),
            tags: ["stop".to_string()].into_iter().collect(),
            output: None,
            error: None,
            changed: true,
        }
    }

    #[test]
    fn test_queries() {
        let s = snapshot();
        assert!(s.matches("red"));
        assert!(s.matches("red.walk"));
        assert!(!s.matches("green"));
        assert!(s.has_tag("stop"));
        assert!(!s.has_tag("go"));
        assert!(s.is_active());
    }

    #[test]
    fn test_serialization() {
        let s = snapshot();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["value"], json!({"red": "walk"}));
        assert_eq!(json["status"], json!("active"));
        assert!(json.get("error").is_none());

        let parsed: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, s);
    }
}
