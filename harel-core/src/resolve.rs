//! Configuration resolution.
//!
//! Turns any [`StateDescriptor`] into a complete configuration: one active
//! child per active compound node, every child of an active parallel node,
//! and every ancestor of every active node.

use crate::definition::StateKind;
use crate::error::CoreError;
use crate::machine::{descend, Machine};
use crate::node::{NodeIndex, ROOT};
use crate::value::{StateDescriptor, StateValue};
use std::collections::{BTreeMap, BTreeSet};

/// Set of active nodes. Iterates in document order.
pub type Configuration = BTreeSet<NodeIndex>;

impl Machine {
    /// Resolves a descriptor into a complete state value.
    ///
    /// Partial values are completed through initial states; a path or value
    /// that does not name existing nodes is an [`CoreError::InvalidState`].
    pub fn resolve(&self, descriptor: impl Into<StateDescriptor>) -> Result<StateValue, CoreError> {
        let explicit = self.descriptor_nodes(&descriptor.into())?;
        let config = self.complete(&explicit, &Configuration::new())?;
        Ok(self.state_value(&config))
    }

    /// The machine's default initial state value.
    pub fn initial_value(&self) -> StateValue {
        self.state_value(&self.initial_configuration())
    }

    pub(crate) fn initial_configuration(&self) -> Configuration {
        let mut config = Configuration::new();
        self.complete_node(ROOT, &BTreeSet::new(), &Configuration::new(), &mut config)
            .map(|_| config)
            .unwrap_or_default()
    }

    /// Resolves a (possibly partial) state value into a configuration.
    pub(crate) fn configuration(&self, value: &StateValue) -> Result<Configuration, CoreError> {
        let mut explicit = Vec::new();
        self.value_nodes(ROOT, value, &mut explicit)?;
        self.complete(&explicit, &Configuration::new())
    }

    pub(crate) fn descriptor_nodes(
        &self,
        descriptor: &StateDescriptor,
    ) -> Result<Vec<NodeIndex>, CoreError> {
        match descriptor {
            StateDescriptor::Path(path) => Ok(vec![self.path_node(path)?]),
            StateDescriptor::Paths(paths) => paths.iter().map(|p| self.path_node(p)).collect(),
            StateDescriptor::Value(value) => {
                let mut explicit = Vec::new();
                self.value_nodes(ROOT, value, &mut explicit)?;
                Ok(explicit)
            }
        }
    }

    /// `#id` looks up a node id or alias; anything else is a key path from
    /// the root. The empty path names the root.
    fn path_node(&self, path: &str) -> Result<NodeIndex, CoreError> {
        let found = if let Some(id) = path.strip_prefix('#') {
            self.lookup_id(id)
        } else if path.is_empty() {
            Some(ROOT)
        } else {
            descend(self.nodes(), ROOT, path)
        };
        found.ok_or_else(|| {
            CoreError::invalid_state(format!(
                "'{}' does not name a state of '{}'",
                path,
                self.id()
            ))
        })
    }

    fn value_nodes(
        &self,
        node: NodeIndex,
        value: &StateValue,
        out: &mut Vec<NodeIndex>,
    ) -> Result<(), CoreError> {
        match value {
            StateValue::Leaf(key) => {
                out.push(self.child_by_key(node, key)?);
            }
            StateValue::Branch(map) if map.is_empty() => {
                out.push(node);
            }
            StateValue::Branch(map) => {
                for (key, sub) in map {
                    let child = self.child_by_key(node, key)?;
                    out.push(child);
                    self.value_nodes(child, sub, out)?;
                }
            }
        }
        Ok(())
    }

    fn child_by_key(&self, node: NodeIndex, key: &str) -> Result<NodeIndex, CoreError> {
        let parent = self.node(node);
        parent
            .children
            .iter()
            .copied()
            .find(|&c| self.node(c).key == key)
            .ok_or_else(|| {
                CoreError::invalid_state(format!(
                    "'{}' is not a child state of '{}'",
                    key, parent.id
                ))
            })
    }

    /// Completes a configuration from the root.
    ///
    /// Compound nodes take the child leading to an explicit node, else the
    /// child already active in `kept`, else their initial child.
    pub(crate) fn complete(
        &self,
        explicit: &[NodeIndex],
        kept: &Configuration,
    ) -> Result<Configuration, CoreError> {
        let mut marked = BTreeSet::new();
        for &node in explicit {
            marked.insert(node);
            marked.extend(self.ancestors(node));
        }
        let mut config = Configuration::new();
        self.complete_node(ROOT, &marked, kept, &mut config)?;
        Ok(config)
    }

    fn complete_node(
        &self,
        index: NodeIndex,
        marked: &BTreeSet<NodeIndex>,
        kept: &Configuration,
        config: &mut Configuration,
    ) -> Result<(), CoreError> {
        config.insert(index);
        let node = self.node(index);
        match node.kind {
            StateKind::Atomic | StateKind::Final => Ok(()),
            StateKind::Parallel => {
                for &child in &node.children {
                    self.complete_node(child, marked, kept, config)?;
                }
                Ok(())
            }
            StateKind::Compound => {
                let mut chosen = node.children.iter().copied().filter(|c| marked.contains(c));
                let child = match (chosen.next(), chosen.next()) {
                    (Some(a), Some(b)) => {
                        return Err(CoreError::invalid_state(format!(
                            "'{}' and '{}' cannot both be active in '{}'",
                            self.node(a).key,
                            self.node(b).key,
                            node.id
                        )))
                    }
                    (Some(a), None) => a,
                    (None, _) => node
                        .children
                        .iter()
                        .copied()
                        .find(|c| kept.contains(c))
                        .or(node.initial)
                        .ok_or_else(|| {
                            CoreError::invalid_state(format!("'{}' has no initial state", node.id))
                        })?,
                };
                self.complete_node(child, marked, kept, config)
            }
        }
    }

    /// Projects a configuration onto its state value.
    pub(crate) fn state_value(&self, config: &Configuration) -> StateValue {
        self.node_value(ROOT, config)
    }

    fn node_value(&self, index: NodeIndex, config: &Configuration) -> StateValue {
        let node = self.node(index);
        match node.kind {
            StateKind::Atomic | StateKind::Final => StateValue::Branch(BTreeMap::new()),
            StateKind::Compound => {
                let Some(&child) = node.children.iter().find(|c| config.contains(c)) else {
                    return StateValue::Branch(BTreeMap::new());
                };
                let child_node = self.node(child);
                if child_node.is_leaf() {
                    StateValue::Leaf(child_node.key.clone())
                } else {
                    let mut map = BTreeMap::new();
                    map.insert(child_node.key.clone(), self.node_value(child, config));
                    StateValue::Branch(map)
                }
            }
            StateKind::Parallel => StateValue::Branch(
                node.children
                    .iter()
                    .map(|&c| (self.node(c).key.clone(), self.node_value(c, config)))
                    .collect(),
            ),
        }
    }

    /// Union of the tags of every active node.
    pub(crate) fn tags(&self, config: &Configuration) -> BTreeSet<String> {
        config
            .iter()
            .flat_map(|&i| self.node(i).tags.iter().cloned())
            .collect()
    }

    /// Returns true if `index` has reached a final configuration.
    pub(crate) fn is_in_final(&self, index: NodeIndex, config: &Configuration) -> bool {
        let node = self.node(index);
        match node.kind {
            StateKind::Final => true,
            StateKind::Atomic => false,
            StateKind::Compound => node
                .children
                .iter()
                .any(|&c| config.contains(&c) && self.node(c).is_final()),
            StateKind::Parallel => node.children.iter().all(|&c| self.is_in_final(c, config)),
        }
    }
}
