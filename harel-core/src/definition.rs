//! Machine definition types.
//!
//! Machine definitions use a JSON (or YAML) DSL:
//!
//! ```json
//! {
//!   "id": "light",
//!   "initial": "green",
//!   "context": { "cycles": 0 },
//!   "states": {
//!     "green": { "on": { "TIMER": "yellow" } },
//!     "yellow": { "on": { "TIMER": "red" } },
//!     "red": {
//!       "initial": "walk",
//!       "on": { "TIMER": "green" },
//!       "states": {
//!         "walk": { "on": { "PED_COUNTDOWN": "wait" } },
//!         "wait": { "on": { "PED_COUNTDOWN": "stop" } },
//!         "stop": {}
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Key order of `states`, `on` and `after` is preserved; it is the document
//! order used for region order, entry/exit order and priority.

use crate::event::Event;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::marker::PhantomData;

/// Kind of a state node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Atomic,
    Compound,
    Parallel,
    Final,
}

/// A string-keyed map that keeps insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &V)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Serialize> Serialize for OrderedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::new())
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::new())
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut map = OrderedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    if map.get(&key).is_some() {
                        return Err(de::Error::custom(format!("duplicate key '{}'", key)));
                    }
                    map.0.push((key, value));
                }
                Ok(map)
            }
        }

        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(v: OneOrMany<T>) -> Self {
        match v {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

/// An event literal: a bare type or a full event object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventConfig {
    Type(String),
    Event(Event),
}

/// An action as written in a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionConfig {
    /// Named action from implementations.
    Named(String),
    Raise {
        raise: EventConfig,
    },
    /// Shallow-merge literal values into the context.
    Assign {
        assign: Map<String, Value>,
    },
    Log {
        log: String,
    },
    SendParent {
        #[serde(rename = "sendParent")]
        send_parent: EventConfig,
    },
}

/// One action or a list of actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<ActionConfig>", into = "Vec<ActionConfig>")]
pub struct ActionsConfig(pub Vec<ActionConfig>);

impl From<OneOrMany<ActionConfig>> for ActionsConfig {
    fn from(v: OneOrMany<ActionConfig>) -> Self {
        Self(v.into())
    }
}

impl From<ActionsConfig> for Vec<ActionConfig> {
    fn from(v: ActionsConfig) -> Self {
        v.0
    }
}

impl ActionsConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single transition as written in a definition.
///
/// An absent (or `null`) target makes the transition targetless: it runs
/// its actions and consumes the event without changing the configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionConfig {
    #[serde(
        deserialize_with = "deserialize_targets",
        skip_serializing_if = "Option::is_none"
    )]
    pub target: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,

    #[serde(skip_serializing_if = "ActionsConfig::is_empty")]
    pub actions: ActionsConfig,

    /// Re-enter the source state even when the target is the source or one
    /// of its descendants.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reenter: bool,
}

impl TransitionConfig {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: Some(vec![target.into()]),
            ..Default::default()
        }
    }

    /// A transition with no target and no actions.
    pub fn forbidden() -> Self {
        Self::default()
    }
}

fn deserialize_targets<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let targets: Option<OneOrMany<String>> = Option::deserialize(deserializer)?;
    Ok(targets.map(Vec::from))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransitionEntry {
    Target(String),
    Config(TransitionConfig),
}

/// Ordered candidate transitions for one event descriptor.
///
/// Accepts a target string, `null` (forbidden transition), a transition
/// object, or an array of strings/objects in priority order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionsConfig(pub Vec<TransitionConfig>);

impl TransitionsConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TransitionsConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransitionsConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TransitionsVisitor;

        impl<'de> Visitor<'de> for TransitionsVisitor {
            type Value = TransitionsConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a target string, null, a transition object, or an array")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(TransitionsConfig(vec![TransitionConfig::to(v)]))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(TransitionsConfig(vec![TransitionConfig::forbidden()]))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                self.visit_unit()
            }

            fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let config =
                    TransitionConfig::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(TransitionsConfig(vec![config]))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut transitions = Vec::new();
                while let Some(entry) = seq.next_element::<TransitionEntry>()? {
                    transitions.push(match entry {
                        TransitionEntry::Target(target) => TransitionConfig::to(target),
                        TransitionEntry::Config(config) => config,
                    });
                }
                Ok(TransitionsConfig(transitions))
            }
        }

        deserializer.deserialize_any(TransitionsVisitor)
    }
}

/// An invocation started when its state is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Name of the logic in the runtime's registry.
    pub src: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,

    #[serde(rename = "onDone", default, skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionsConfig>,

    #[serde(rename = "onError", default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionsConfig>,
}

/// One invocation or a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OneOrMany<InvokeConfig>", into = "Vec<InvokeConfig>")]
pub struct InvokesConfig(pub Vec<InvokeConfig>);

impl From<OneOrMany<InvokeConfig>> for InvokesConfig {
    fn from(v: OneOrMany<InvokeConfig>) -> Self {
        Self(v.into())
    }
}

impl From<InvokesConfig> for Vec<InvokeConfig> {
    fn from(v: InvokesConfig) -> Self {
        v.0
    }
}

impl InvokesConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A state node as written in a definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateNodeConfig {
    /// Inferred from `states` when absent.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<StateKind>,

    /// Alias addressable as `#alias`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    pub states: OrderedMap<StateNodeConfig>,

    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    pub on: OrderedMap<TransitionsConfig>,

    #[serde(skip_serializing_if = "TransitionsConfig::is_empty")]
    pub always: TransitionsConfig,

    #[serde(skip_serializing_if = "ActionsConfig::is_empty")]
    pub entry: ActionsConfig,

    #[serde(skip_serializing_if = "ActionsConfig::is_empty")]
    pub exit: ActionsConfig,

    #[serde(skip_serializing_if = "InvokesConfig::is_empty")]
    pub invoke: InvokesConfig,

    /// Delay key (milliseconds or a named delay) to transitions.
    #[serde(skip_serializing_if = "OrderedMap::is_empty")]
    pub after: OrderedMap<TransitionsConfig>,

    #[serde(rename = "onDone", skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionsConfig>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Output of a final state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Raw machine definition as stored/transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine id; also the id of the root state node.
    pub id: String,

    /// Default context.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,

    #[serde(flatten)]
    pub root: StateNodeConfig,
}

impl MachineConfig {
    pub fn from_json(json: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json.clone())
    }
}
