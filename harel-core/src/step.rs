//! Microstep engine.

use crate::action::{merge_ctx, Action, Effect};
use crate::command::ActorCommand;
use crate::definition::StateKind;
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::Machine;
use crate::node::{NodeIndex, TransitionDef, ROOT};
use crate::resolve::Configuration;
use crate::snapshot::{ChildRef, Snapshot, Status};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

/// Working copy of a machine's state while a macrostep runs. Nothing in
/// here is visible to observers until the macrostep commits.
#[derive(Debug, Clone)]
pub(crate) struct StepState {
    pub configuration: Configuration,
    pub context: Value,
    pub queue: VecDeque<Event>,
    pub actions: Vec<String>,
    pub commands: Vec<ActorCommand>,
    pub children: BTreeMap<String, ChildRef>,
    pub status: Status,
    pub output: Option<Value>,
}

impl StepState {
    pub fn new(context: Value) -> Self {
        Self {
            configuration: Configuration::new(),
            context,
            queue: VecDeque::new(),
            actions: Vec::new(),
            commands: Vec::new(),
            children: BTreeMap::new(),
            status: Status::Active,
            output: None,
        }
    }

    pub fn from_snapshot(configuration: Configuration, snapshot: &Snapshot) -> Self {
        Self {
            configuration,
            context: snapshot.context.clone(),
            queue: snapshot.internal_queue.iter().cloned().collect(),
            actions: Vec::new(),
            commands: Vec::new(),
            children: snapshot.children.clone(),
            status: snapshot.status,
            output: snapshot.output.clone(),
        }
    }
}

impl Machine {
    /// Applies one selected transition set: exits, transition actions,
    /// then entries.
    pub(crate) fn microstep(
        &self,
        state: &mut StepState,
        transitions: &[&TransitionDef],
        event: &Event,
    ) -> Result<(), CoreError> {
        let mut exits = Configuration::new();
        let mut targets: Vec<NodeIndex> = Vec::new();
        for transition in transitions {
            exits.extend(self.exit_set(transition, &state.configuration));
            if let Some(ts) = &transition.targets {
                targets.extend(ts.iter().copied());
            }
        }

        let kept: Configuration = state.configuration.difference(&exits).copied().collect();
        let next = if targets.is_empty() {
            state.configuration.clone()
        } else {
            self.complete(&targets, &kept)?
        };
        let entries: Configuration = next.difference(&kept).copied().collect();

        tracing::trace!(
            machine = %self.id(),
            event = %event,
            transitions = ?transitions.iter().map(|t| t.label.as_str()).collect::<Vec<_>>(),
            exits = exits.len(),
            entries = entries.len(),
            "microstep"
        );

        for &node in exits.iter().rev() {
            self.exit_node(state, node, event)?;
        }
        state.configuration = kept;

        for transition in transitions {
            for action in &transition.actions {
                self.run_action(state, action, event)?;
            }
        }

        self.enter_nodes(state, &entries, event)?;
        state.configuration = next;
        Ok(())
    }

    fn exit_node(&self, state: &mut StepState, index: NodeIndex, event: &Event) -> Result<(), CoreError> {
        let node = self.node(index);
        for action in &node.exit {
            self.run_action(state, action, event)?;
        }
        self.stop_activities(index, &mut state.children, &mut state.commands);
        state.configuration.remove(&index);
        Ok(())
    }

    /// Enters `entries` in document order, then raises completion events for
    /// any final states reached.
    pub(crate) fn enter_nodes(
        &self,
        state: &mut StepState,
        entries: &Configuration,
        event: &Event,
    ) -> Result<(), CoreError> {
        let mut finals = Vec::new();
        for &index in entries {
            let node = self.node(index);
            state.configuration.insert(index);
            for action in &node.entry {
                self.run_action(state, action, event)?;
            }
            self.start_activities(
                index,
                &state.context,
                event,
                &mut state.children,
                &mut state.commands,
            )?;
            if node.is_final() {
                finals.push(index);
            }
        }

        for index in finals {
            self.complete_final(state, index);
        }
        Ok(())
    }

    /// Schedules the node's delayed transitions and spawns its invocations.
    pub(crate) fn start_activities(
        &self,
        index: NodeIndex,
        ctx: &Value,
        event: &Event,
        children: &mut BTreeMap<String, ChildRef>,
        commands: &mut Vec<ActorCommand>,
    ) -> Result<(), CoreError> {
        let node = self.node(index);
        for delayed in &node.delayed {
            commands.push(ActorCommand::Schedule {
                id: delayed.event_type.clone(),
                event: Event::new(delayed.event_type.as_str()),
                delay: self.delay_duration(delayed, ctx, event)?,
            });
        }
        for invocation in &node.invocations {
            children.insert(
                invocation.id.clone(),
                ChildRef {
                    id: invocation.id.clone(),
                    src: invocation.src.clone(),
                    state_node: node.id.clone(),
                },
            );
            commands.push(ActorCommand::Spawn {
                id: invocation.id.clone(),
                src: invocation.src.clone(),
                input: invocation.input.clone(),
                node: node.id.clone(),
            });
        }
        Ok(())
    }

    /// Unschedules the node's delayed transitions and cancels its invocations.
    pub(crate) fn stop_activities(
        &self,
        index: NodeIndex,
        children: &mut BTreeMap<String, ChildRef>,
        commands: &mut Vec<ActorCommand>,
    ) {
        let node = self.node(index);
        for delayed in &node.delayed {
            commands.push(ActorCommand::Unschedule {
                id: delayed.event_type.clone(),
            });
        }
        for invocation in &node.invocations {
            children.remove(&invocation.id);
            commands.push(ActorCommand::Cancel {
                id: invocation.id.clone(),
            });
        }
    }

    /// Handles entry into a final state: a top-level final state finishes
    /// the machine; otherwise the parent (and a parallel grandparent whose
    /// regions are all final) raise `done.state` events.
    fn complete_final(&self, state: &mut StepState, index: NodeIndex) {
        let node = self.node(index);
        let Some(parent) = node.parent else {
            state.status = Status::Done;
            state.output = node.output.clone();
            return;
        };
        let parent_node = self.node(parent);
        if parent_node.kind == StateKind::Parallel {
            self.complete_parallel(state, parent);
            return;
        }
        if parent == ROOT {
            state.status = Status::Done;
            state.output = node.output.clone();
            return;
        }

        let output = node.output.clone().unwrap_or(Value::Null);
        state
            .queue
            .push_back(Event::done_state(&parent_node.id, output));

        if let Some(grandparent) = parent_node.parent {
            if self.node(grandparent).kind == StateKind::Parallel {
                self.complete_parallel(state, grandparent);
            }
        }
    }

    fn complete_parallel(&self, state: &mut StepState, index: NodeIndex) {
        if !self.is_in_final(index, &state.configuration) {
            return;
        }
        if index == ROOT {
            state.status = Status::Done;
            return;
        }
        let done = Event::done_state(&self.node(index).id, Value::Null);
        // several regions may finish in the same microstep
        if !state.queue.contains(&done) {
            state.queue.push_back(done);
        }
    }

    pub(crate) fn run_action(
        &self,
        state: &mut StepState,
        action: &Action,
        event: &Event,
    ) -> Result<(), CoreError> {
        state.actions.push(action.label());
        let effects = action.execute(self.implementations(), self.id(), &state.context, event)?;
        for effect in effects {
            match effect {
                Effect::Assign(fields) => state.context = merge_ctx(&state.context, &fields),
                Effect::Raise(raised) => state.queue.push_back(raised),
                Effect::SendParent(sent) => state.commands.push(ActorCommand::SendParent(sent)),
                Effect::SendTo { id, event } => {
                    state.commands.push(ActorCommand::SendTo { id, event })
                }
                Effect::Done(output) => {
                    state.status = Status::Done;
                    state.output = output;
                }
            }
        }
        Ok(())
    }
}
