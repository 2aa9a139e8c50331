//! State values and state descriptors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Serializable projection of a configuration.
///
/// A compound node whose active child is a leaf projects to `Leaf(child)`;
/// otherwise to `Branch({child: value})`. Parallel nodes project to a branch
/// holding every region; an atomic region projects to an empty branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Leaf(String),
    Branch(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Converts a dot-separated path (`red.walk`) into a nested value.
    pub fn from_path(path: &str) -> Self {
        let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some(last) = segments.pop() else {
            return StateValue::Branch(BTreeMap::new());
        };
        let mut value = StateValue::Leaf(last.to_string());
        while let Some(segment) = segments.pop() {
            let mut map = BTreeMap::new();
            map.insert(segment.to_string(), value);
            value = StateValue::Branch(map);
        }
        value
    }

    pub fn as_leaf(&self) -> Option<&str> {
        match self {
            StateValue::Leaf(s) => Some(s),
            StateValue::Branch(_) => None,
        }
    }

    /// Returns true if `self` (the full value) matches `parent`, a possibly
    /// partial value.
    ///
    /// `{red: "walk"}` matches `"red"`, `{red: "walk"}` and `"red.walk"`.
    pub fn matches(&self, parent: &StateValue) -> bool {
        match (parent, self) {
            (StateValue::Leaf(p), StateValue::Leaf(c)) => p == c,
            (StateValue::Leaf(p), StateValue::Branch(map)) => map.contains_key(p),
            (StateValue::Branch(pmap), StateValue::Leaf(c)) => {
                // {green: {}} is the same selection as "green"
                pmap.len() == 1
                    && pmap
                        .get(c)
                        .map(|v| matches!(v, StateValue::Branch(m) if m.is_empty()))
                        .unwrap_or(false)
            }
            (StateValue::Branch(pmap), StateValue::Branch(cmap)) => {
                pmap.iter().all(|(key, pv)| match cmap.get(key) {
                    Some(cv) => match pv {
                        StateValue::Branch(m) if m.is_empty() => true,
                        _ => cv.matches(pv),
                    },
                    None => false,
                })
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::from_path(s)
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::from_path(&s)
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Leaf(s) => f.write_str(s),
            StateValue::Branch(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

/// Any accepted way of naming a state: a path (`red.walk`, `#light.red`), a
/// list of paths, or a nested value.
///
/// Normalized by the resolver into a set of explicit nodes; nothing past the
/// resolver branches on the descriptor shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateDescriptor {
    Path(String),
    Paths(Vec<String>),
    Value(StateValue),
}

impl From<&str> for StateDescriptor {
    fn from(s: &str) -> Self {
        StateDescriptor::Path(s.to_string())
    }
}

impl From<StateValue> for StateDescriptor {
    fn from(v: StateValue) -> Self {
        StateDescriptor::Value(v)
    }
}

impl From<Vec<&str>> for StateDescriptor {
    fn from(paths: Vec<&str>) -> Self {
        StateDescriptor::Paths(paths.into_iter().map(String::from).collect())
    }
}
