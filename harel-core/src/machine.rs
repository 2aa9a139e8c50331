//! Compiled machine.
//!
//! A [`Machine`] is built once from a [`MachineConfig`] in two phases: the
//! first pass lays out every node in an arena (pre-order, so indices follow
//! document order); the second compiles transitions, rewriting every target
//! string into a node index. The machine is immutable afterwards and can be
//! shared freely between actors.

use crate::action::Action;
use crate::definition::{ActionsConfig, MachineConfig, StateKind, StateNodeConfig, TransitionsConfig};
use crate::error::CoreError;
use crate::event::{after_type, done_state_type, DONE_INVOKE_PREFIX, ERROR_INVOKE_PREFIX};
use crate::guard::Guard;
use crate::implementations::Implementations;
use crate::node::{
    Delay, DelayedTransition, Invocation, NodeIndex, StateNode, TransitionDef, ROOT,
};
use crate::resolve::Configuration;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Default cap on microsteps per macrostep.
pub const DEFAULT_MAX_MICROSTEPS: usize = 1000;

/// A compiled, immutable statechart.
#[derive(Debug, Clone)]
pub struct Machine {
    id: String,
    definition: MachineConfig,
    nodes: Vec<StateNode>,
    /// Full node ids and `#alias` names.
    ids: HashMap<String, NodeIndex>,
    context: Value,
    implementations: Implementations,
    checksum: String,
    max_microsteps: usize,
}

impl Machine {
    /// Compiles a machine from its JSON definition.
    pub fn from_json(json: &Value, implementations: Implementations) -> Result<Self, CoreError> {
        let config: MachineConfig = serde_json::from_value(json.clone())?;
        Self::from_config(config, implementations)
    }

    /// Compiles a machine from a parsed definition.
    pub fn from_config(
        config: MachineConfig,
        implementations: Implementations,
    ) -> Result<Self, CoreError> {
        if config.id.is_empty() || config.id.contains('.') || config.id.starts_with('#') {
            return Err(CoreError::invalid_definition(format!(
                "invalid machine id '{}'",
                config.id
            )));
        }

        let context = match &config.context {
            Value::Null => json!({}),
            Value::Object(_) => config.context.clone(),
            _ => {
                return Err(CoreError::invalid_definition(
                    "context must be a JSON object",
                ))
            }
        };

        let json_bytes = serde_json::to_vec(&config)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&json_bytes));

        let (nodes, ids) = {
            let mut builder = Builder::new(&implementations);
            builder.add_node(&config.id, config.id.clone(), &config.root, None, 0)?;
            for index in 0..builder.nodes.len() {
                builder.compile_node(index)?;
            }
            (builder.nodes, builder.ids)
        };

        let machine = Machine {
            id: config.id.clone(),
            definition: config,
            nodes,
            ids,
            context,
            implementations,
            checksum,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
        };
        machine.validate_multi_targets()?;

        tracing::debug!(
            machine = %machine.id,
            nodes = machine.nodes.len(),
            checksum = %machine.checksum,
            "compiled machine"
        );
        Ok(machine)
    }

    /// Sets the microstep cap used to detect non-terminating macrosteps.
    pub fn with_max_microsteps(mut self, max_microsteps: usize) -> Self {
        self.max_microsteps = max_microsteps.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// crc32c of the serialized definition as 8 hex digits.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn definition(&self) -> &MachineConfig {
        &self.definition
    }

    /// Default context, before any start input is merged in.
    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn implementations(&self) -> &Implementations {
        &self.implementations
    }

    pub fn max_microsteps(&self) -> usize {
        self.max_microsteps
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> &[StateNode] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> &StateNode {
        &self.nodes[ROOT]
    }

    pub fn node(&self, index: NodeIndex) -> &StateNode {
        &self.nodes[index]
    }

    /// Looks up a node by full id (`light.red.walk`) or alias.
    pub fn node_by_id(&self, id: &str) -> Option<&StateNode> {
        self.ids.get(id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn lookup_id(&self, id: &str) -> Option<NodeIndex> {
        self.ids.get(id).copied()
    }

    /// Returns true if `node` is a proper descendant of `ancestor`.
    pub(crate) fn is_descendant(&self, node: NodeIndex, ancestor: NodeIndex) -> bool {
        let mut cursor = self.nodes[node].parent;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.nodes[current].parent;
        }
        false
    }

    /// Proper ancestors of `node`, innermost first.
    pub(crate) fn ancestors(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::successors(self.nodes[node].parent, move |&n| self.nodes[n].parent)
    }

    /// Named delays are checked against the implementations when the machine
    /// is built, so a missing one here means the two were mixed up.
    pub(crate) fn delay_duration(
        &self,
        delayed: &DelayedTransition,
        ctx: &Value,
        event: &crate::event::Event,
    ) -> Result<Duration, CoreError> {
        match &delayed.delay {
            Delay::Fixed(duration) => Ok(*duration),
            Delay::Named(name) => self
                .implementations
                .call_delay(name, ctx, event)
                .ok_or_else(|| {
                    CoreError::invalid_definition(format!("delay '{}' is not implemented", name))
                }),
        }
    }

    /// Every transition of every node, in document order.
    pub(crate) fn all_transitions(&self) -> impl Iterator<Item = &TransitionDef> {
        self.nodes.iter().flat_map(|node| {
            node.on
                .iter()
                .flat_map(|(_, ts)| ts.iter())
                .chain(node.always.iter())
        })
    }

    fn validate_multi_targets(&self) -> Result<(), CoreError> {
        for transition in self.all_transitions() {
            let Some(targets) = &transition.targets else {
                continue;
            };
            if targets.len() < 2 {
                continue;
            }
            self.complete(targets, &Configuration::new())
                .map_err(|e| {
                    CoreError::invalid_definition(format!(
                        "targets of '{}' cannot be active together: {}",
                        transition.label, e
                    ))
                })?;
        }
        Ok(())
    }
}

/// Walks `path` (dot-separated child keys) down from `base`.
pub(crate) fn descend(nodes: &[StateNode], base: NodeIndex, path: &str) -> Option<NodeIndex> {
    path.split('.').try_fold(base, |current, segment| {
        nodes[current]
            .children
            .iter()
            .copied()
            .find(|&c| nodes[c].key == segment)
    })
}

struct Builder<'a> {
    implementations: &'a Implementations,
    nodes: Vec<StateNode>,
    configs: Vec<&'a StateNodeConfig>,
    ids: HashMap<String, NodeIndex>,
    invocation_ids: HashSet<String>,
}

impl<'a> Builder<'a> {
    fn new(implementations: &'a Implementations) -> Self {
        Self {
            implementations,
            nodes: Vec::new(),
            configs: Vec::new(),
            ids: HashMap::new(),
            invocation_ids: HashSet::new(),
        }
    }

    fn register_id(&mut self, id: String, index: NodeIndex) -> Result<(), CoreError> {
        if self.ids.contains_key(&id) {
            return Err(CoreError::invalid_definition(format!(
                "duplicate state id '{}'",
                id
            )));
        }
        self.ids.insert(id, index);
        Ok(())
    }

    fn add_node(
        &mut self,
        key: &str,
        id: String,
        config: &'a StateNodeConfig,
        parent: Option<NodeIndex>,
        depth: usize,
    ) -> Result<NodeIndex, CoreError> {
        if parent.is_some() && (key.is_empty() || key.contains('.') || key.starts_with('#')) {
            return Err(CoreError::invalid_definition(format!(
                "invalid state key '{}' in '{}'",
                key, id
            )));
        }

        let kind = match (config.kind, config.states.is_empty()) {
            (Some(StateKind::Atomic), false) | (Some(StateKind::Final), false) => {
                return Err(CoreError::invalid_definition(format!(
                    "state '{}' is atomic or final but has child states",
                    id
                )))
            }
            (Some(StateKind::Compound), true) | (Some(StateKind::Parallel), true) => {
                return Err(CoreError::invalid_definition(format!(
                    "state '{}' has no child states",
                    id
                )))
            }
            (Some(kind), _) => kind,
            (None, true) => StateKind::Atomic,
            (None, false) => StateKind::Compound,
        };

        if config.output.is_some() && kind != StateKind::Final {
            return Err(CoreError::invalid_definition(format!(
                "state '{}' declares output but is not final",
                id
            )));
        }

        let index = self.nodes.len();
        self.register_id(id.clone(), index)?;
        if let Some(alias) = &config.id {
            if alias.is_empty() || alias.starts_with('#') {
                return Err(CoreError::invalid_definition(format!(
                    "invalid id '{}' on state '{}'",
                    alias, id
                )));
            }
            if *alias != id {
                self.register_id(alias.clone(), index)?;
            }
        }

        self.nodes.push(StateNode {
            index,
            key: key.to_string(),
            id: id.clone(),
            kind,
            parent,
            children: Vec::new(),
            initial: None,
            depth,
            on: Vec::new(),
            always: Vec::new(),
            entry: Vec::new(),
            exit: Vec::new(),
            invocations: Vec::new(),
            delayed: Vec::new(),
            tags: config.tags.clone(),
            output: config.output.clone(),
        });
        self.configs.push(config);

        let mut children = Vec::with_capacity(config.states.len());
        for (child_key, child_config) in config.states.iter() {
            let child_id = format!("{}.{}", id, child_key);
            children.push(self.add_node(child_key, child_id, child_config, Some(index), depth + 1)?);
        }

        let initial = match kind {
            StateKind::Compound => Some(match &config.initial {
                Some(initial) => children
                    .iter()
                    .copied()
                    .find(|&c| self.nodes[c].key == *initial)
                    .ok_or_else(|| {
                        CoreError::invalid_definition(format!(
                            "initial state '{}' of '{}' is not one of its child states",
                            initial, id
                        ))
                    })?,
                None if children.len() == 1 => children[0],
                None => {
                    return Err(CoreError::invalid_definition(format!(
                        "compound state '{}' has no initial state",
                        id
                    )))
                }
            }),
            _ => {
                if let Some(initial) = &config.initial {
                    return Err(CoreError::invalid_definition(format!(
                        "state '{}' is not compound but declares initial state '{}'",
                        id, initial
                    )));
                }
                None
            }
        };

        let node = &mut self.nodes[index];
        node.children = children;
        node.initial = initial;
        Ok(index)
    }

    fn compile_node(&mut self, index: NodeIndex) -> Result<(), CoreError> {
        let config = self.configs[index];
        let node_id = self.nodes[index].id.clone();
        let is_leaf = self.nodes[index].is_leaf();

        let mut on: Vec<(String, Vec<TransitionDef>)> = Vec::new();
        for (descriptor, transitions) in config.on.iter() {
            if descriptor.is_empty() {
                return Err(CoreError::invalid_definition(format!(
                    "empty event descriptor on '{}'",
                    node_id
                )));
            }
            let compiled = self.compile_transitions(index, Some(descriptor), transitions)?;
            push_transitions(&mut on, descriptor, compiled);
        }

        let always = self.compile_transitions(index, None, &config.always)?;

        let mut delayed = Vec::with_capacity(config.after.len());
        for (key, transitions) in config.after.iter() {
            let delay = match key.parse::<u64>() {
                Ok(ms) => Delay::Fixed(Duration::from_millis(ms)),
                Err(_) if self.implementations.has_delay(key) => Delay::Named(key.clone()),
                Err(_) => {
                    return Err(CoreError::invalid_definition(format!(
                        "delay '{}' on '{}' is not implemented",
                        key, node_id
                    )))
                }
            };
            let event_type = after_type(key, &node_id);
            let compiled = self.compile_transitions(index, Some(&event_type), transitions)?;
            push_transitions(&mut on, &event_type, compiled);
            delayed.push(DelayedTransition {
                key: key.clone(),
                event_type,
                delay,
            });
        }

        if let Some(on_done) = &config.on_done {
            if is_leaf {
                return Err(CoreError::invalid_definition(format!(
                    "state '{}' declares onDone but has no child states",
                    node_id
                )));
            }
            let event_type = done_state_type(&node_id);
            let compiled = self.compile_transitions(index, Some(&event_type), on_done)?;
            push_transitions(&mut on, &event_type, compiled);
        }

        let mut invocations = Vec::with_capacity(config.invoke.0.len());
        for (n, invoke) in config.invoke.0.iter().enumerate() {
            let id = invoke
                .id
                .clone()
                .unwrap_or_else(|| format!("{}:invocation[{}]", node_id, n));
            if invoke.src.is_empty() {
                return Err(CoreError::invalid_definition(format!(
                    "invocation '{}' has no src",
                    id
                )));
            }
            if !self.invocation_ids.insert(id.clone()) {
                return Err(CoreError::invalid_definition(format!(
                    "duplicate invocation id '{}'",
                    id
                )));
            }
            for (prefix, transitions) in [
                (DONE_INVOKE_PREFIX, &invoke.on_done),
                (ERROR_INVOKE_PREFIX, &invoke.on_error),
            ] {
                if let Some(transitions) = transitions {
                    let event_type = format!("{}{}", prefix, id);
                    let compiled = self.compile_transitions(index, Some(&event_type), transitions)?;
                    push_transitions(&mut on, &event_type, compiled);
                }
            }
            invocations.push(Invocation {
                id,
                src: invoke.src.clone(),
                input: invoke.input.clone(),
            });
        }

        let entry = self.compile_actions(&config.entry)?;
        let exit = self.compile_actions(&config.exit)?;

        let node = &mut self.nodes[index];
        node.on = on;
        node.always = always;
        node.delayed = delayed;
        node.invocations = invocations;
        node.entry = entry;
        node.exit = exit;
        Ok(())
    }

    fn compile_actions(&self, config: &ActionsConfig) -> Result<Vec<Action>, CoreError> {
        config
            .0
            .iter()
            .map(|a| Action::compile(a, self.implementations))
            .collect()
    }

    fn compile_transitions(
        &self,
        source: NodeIndex,
        event: Option<&str>,
        config: &TransitionsConfig,
    ) -> Result<Vec<TransitionDef>, CoreError> {
        config
            .0
            .iter()
            .map(|t| {
                let guard = t
                    .guard
                    .as_deref()
                    .map(|g| Guard::compile(g, self.implementations))
                    .transpose()?;
                let targets = match &t.target {
                    Some(targets) if !targets.is_empty() => Some(
                        targets
                            .iter()
                            .map(|target| self.resolve_target(source, target))
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    _ => None,
                };
                let actions = self.compile_actions(&t.actions)?;
                let label = format!(
                    "{} --{}--> {}",
                    self.nodes[source].id,
                    event.unwrap_or("always"),
                    match &targets {
                        Some(targets) => targets
                            .iter()
                            .map(|&i| self.nodes[i].id.as_str())
                            .collect::<Vec<_>>()
                            .join(","),
                        None => "(none)".to_string(),
                    }
                );
                Ok(TransitionDef {
                    source,
                    event: event.map(String::from),
                    guard,
                    targets,
                    actions,
                    reenter: t.reenter,
                    label,
                })
            })
            .collect()
    }

    /// Resolves `#id`, `.child.path` (from the source) or `sibling.path`
    /// (from the source's parent; from the root for the root itself).
    fn resolve_target(&self, source: NodeIndex, target: &str) -> Result<NodeIndex, CoreError> {
        let found = if let Some(id) = target.strip_prefix('#') {
            self.ids.get(id).copied()
        } else if let Some(path) = target.strip_prefix('.') {
            descend(&self.nodes, source, path)
        } else {
            let base = self.nodes[source].parent.unwrap_or(source);
            descend(&self.nodes, base, target)
        };
        found.ok_or_else(|| {
            CoreError::invalid_definition(format!(
                "target '{}' of '{}' does not exist",
                target, self.nodes[source].id
            ))
        })
    }
}

fn push_transitions(
    on: &mut Vec<(String, Vec<TransitionDef>)>,
    descriptor: &str,
    transitions: Vec<TransitionDef>,
) {
    match on.iter_mut().find(|(d, _)| d == descriptor) {
        Some((_, existing)) => existing.extend(transitions),
        None => on.push((descriptor.to_string(), transitions)),
    }
}
