//! Compiled state nodes.

use crate::action::Action;
use crate::definition::StateKind;
use crate::guard::Guard;
use serde_json::Value;
use std::time::Duration;

/// Index of a node in the machine's arena. Indices follow document order
/// (pre-order), so sorting by index sorts by document order.
pub type NodeIndex = usize;

/// Index of the root node.
pub const ROOT: NodeIndex = 0;

/// A compiled transition with resolved targets.
#[derive(Debug, Clone)]
pub struct TransitionDef {
    pub source: NodeIndex,
    /// Event descriptor; `None` for eventless (`always`) transitions.
    pub event: Option<String>,
    pub guard: Option<Guard>,
    /// `None` for targetless transitions.
    pub targets: Option<Vec<NodeIndex>>,
    pub actions: Vec<Action>,
    pub reenter: bool,
    /// Human-readable `source --EVENT--> target` form used in errors and traces.
    pub label: String,
}

impl TransitionDef {
    pub fn is_targetless(&self) -> bool {
        self.targets.is_none()
    }
}

/// How long a delayed transition waits.
#[derive(Debug, Clone, PartialEq)]
pub enum Delay {
    Fixed(Duration),
    /// Resolved through the machine's implementations on entry.
    Named(String),
}

/// A delayed (`after`) transition owned by a node.
#[derive(Debug, Clone)]
pub struct DelayedTransition {
    /// Key as written in the definition.
    pub key: String,
    /// Synthetic event type; doubles as the timer id.
    pub event_type: String,
    pub delay: Delay,
}

/// An invocation started when its node is entered.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: String,
    pub src: String,
    pub input: Value,
}

/// A node of the compiled state tree.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub index: NodeIndex,
    /// Key within the parent's `states` map.
    pub key: String,
    /// Dot-separated path from the root, starting with the machine id.
    pub id: String,
    pub kind: StateKind,
    pub parent: Option<NodeIndex>,
    /// Children in document order.
    pub children: Vec<NodeIndex>,
    pub initial: Option<NodeIndex>,
    pub depth: usize,
    /// Event descriptor to candidate transitions in priority order.
    pub on: Vec<(String, Vec<TransitionDef>)>,
    pub always: Vec<TransitionDef>,
    pub entry: Vec<Action>,
    pub exit: Vec<Action>,
    pub invocations: Vec<Invocation>,
    pub delayed: Vec<DelayedTransition>,
    pub tags: Vec<String>,
    pub output: Option<Value>,
}

impl StateNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_final(&self) -> bool {
        self.kind == StateKind::Final
    }

    /// Returns the candidate transitions declared for `descriptor`.
    pub fn transitions_for(&self, descriptor: &str) -> Option<&[TransitionDef]> {
        self.on
            .iter()
            .find(|(d, _)| d == descriptor)
            .map(|(_, ts)| ts.as_slice())
    }

    /// Every event descriptor this node declares.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.on.iter().map(|(d, _)| d.as_str())
    }
}
