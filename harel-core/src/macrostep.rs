//! Run-to-completion scheduling.
//!
//! One external event produces one macrostep: a microstep for the event,
//! then a microstep for every raised event and every enabled eventless
//! transition until nothing is left to do.

use crate::action::merge_ctx;
use crate::command::{compact, ActorCommand};
use crate::error::CoreError;
use crate::event::Event;
use crate::machine::Machine;
use crate::resolve::Configuration;
use crate::snapshot::{ErrorInfo, Snapshot, Status};
use crate::step::StepState;
use serde_json::Value;
use std::collections::BTreeMap;

/// Result of processing one event.
#[derive(Debug, Clone)]
pub struct Macrostep {
    /// The settled snapshot.
    pub snapshot: Snapshot,
    /// Snapshot after each microstep, in order.
    pub microsteps: Vec<Snapshot>,
    /// Commands for the hosting runtime, in order.
    pub commands: Vec<ActorCommand>,
}

impl Machine {
    /// Enters the initial configuration, running entry actions with the
    /// `harel.init` event. `input` is merged into the default context.
    pub fn initial_snapshot(&self, input: Option<Value>) -> Result<Macrostep, CoreError> {
        let context = match input {
            None | Some(Value::Null) => self.context().clone(),
            Some(Value::Object(fields)) => merge_ctx(self.context(), &fields),
            Some(_) => return Err(CoreError::invalid_state("start input must be a JSON object")),
        };

        let mut state = StepState::new(context.clone());
        let mut microsteps = Vec::new();
        match self.run_initial(&mut state, &mut microsteps) {
            Ok(()) => {
                let macrostep = self.commit(state, microsteps, None);
                tracing::debug!(
                    machine = %self.id(),
                    value = %macrostep.snapshot.value,
                    "entered initial state"
                );
                Ok(macrostep)
            }
            Err(e) if e.is_fault() => {
                let configuration = self.initial_configuration();
                let base = Snapshot {
                    machine_id: self.id().to_string(),
                    value: self.state_value(&configuration),
                    context,
                    status: Status::Active,
                    history_actions: Vec::new(),
                    internal_queue: Vec::new(),
                    children: BTreeMap::new(),
                    tags: self.tags(&configuration),
                    output: None,
                    error: None,
                    changed: true,
                };
                // nothing was started yet, so there is nothing to tear down
                Ok(self.fault(&base, &Configuration::new(), &Event::init(), &e))
            }
            Err(e) => Err(e),
        }
    }

    /// Processes one event against `snapshot`.
    ///
    /// Events sent to a machine that is no longer active are ignored.
    /// Conflicting transitions and invalid snapshots return `Err` and
    /// commit nothing; faults in actions or guards return a snapshot with
    /// `status = error`.
    pub fn transition(&self, snapshot: &Snapshot, event: Event) -> Result<Macrostep, CoreError> {
        self.check_machine_id(snapshot)?;
        if snapshot.status != Status::Active {
            tracing::debug!(
                machine = %self.id(),
                event = %event,
                status = %snapshot.status,
                "ignoring event for inactive machine"
            );
            return Ok(Macrostep::unchanged(snapshot));
        }

        let configuration = self.configuration(&snapshot.value)?;
        let mut state = StepState::from_snapshot(configuration.clone(), snapshot);
        if let Some(id) = event.invocation_id() {
            state.children.remove(id);
        }

        let mut microsteps = Vec::new();
        match self.run_external(&mut state, &event, &mut microsteps) {
            Ok(()) => {
                let macrostep = self.commit(state, microsteps, Some(snapshot));
                tracing::debug!(
                    machine = %self.id(),
                    event = %event,
                    value = %macrostep.snapshot.value,
                    changed = macrostep.snapshot.changed,
                    "macrostep"
                );
                Ok(macrostep)
            }
            Err(e) if e.is_fault() => Ok(self.fault(snapshot, &configuration, &event, &e)),
            Err(e) => Err(e),
        }
    }

    /// Rebuilds a persisted snapshot.
    ///
    /// Invocations and timers cannot be resumed, so the returned commands
    /// start every activity of the active configuration afresh. Entry actions
    /// are not run again.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<Macrostep, CoreError> {
        self.check_machine_id(snapshot)?;
        let configuration = self.configuration(&snapshot.value)?;

        let mut restored = snapshot.clone();
        restored.value = self.state_value(&configuration);
        restored.tags = self.tags(&configuration);
        restored.children.clear();
        restored.history_actions.clear();
        restored.changed = false;

        let mut commands = Vec::new();
        if restored.status == Status::Active {
            let event = Event::init();
            for &index in &configuration {
                self.start_activities(
                    index,
                    &restored.context,
                    &event,
                    &mut restored.children,
                    &mut commands,
                )?;
            }
        }

        tracing::debug!(
            machine = %self.id(),
            value = %restored.value,
            commands = commands.len(),
            "restored snapshot"
        );
        Ok(Macrostep {
            snapshot: restored,
            microsteps: Vec::new(),
            commands,
        })
    }

    fn check_machine_id(&self, snapshot: &Snapshot) -> Result<(), CoreError> {
        if snapshot.machine_id != self.id() {
            return Err(CoreError::invalid_state(format!(
                "snapshot belongs to machine '{}', not '{}'",
                snapshot.machine_id,
                self.id()
            )));
        }
        Ok(())
    }

    fn run_initial(
        &self,
        state: &mut StepState,
        microsteps: &mut Vec<Snapshot>,
    ) -> Result<(), CoreError> {
        let event = Event::init();
        let entries = self.initial_configuration();
        self.enter_nodes(state, &entries, &event)?;
        microsteps.push(self.step_snapshot(state, 0));
        self.settle(state, event, 1, microsteps)
    }

    fn run_external(
        &self,
        state: &mut StepState,
        event: &Event,
        microsteps: &mut Vec<Snapshot>,
    ) -> Result<(), CoreError> {
        let selection = self.select(&state.configuration, event, false, &state.context)?;
        if selection.is_empty() && state.queue.is_empty() {
            return Ok(());
        }
        let mut steps = 0;
        if !selection.is_empty() {
            self.microstep(state, &selection, event)?;
            steps += 1;
            microsteps.push(self.step_snapshot(state, 0));
        }
        self.settle(state, event.clone(), steps, microsteps)
    }

    /// Drains raised events and eventless transitions.
    fn settle(
        &self,
        state: &mut StepState,
        mut last_event: Event,
        mut steps: usize,
        microsteps: &mut Vec<Snapshot>,
    ) -> Result<(), CoreError> {
        loop {
            if state.status != Status::Active {
                return Ok(());
            }
            if steps >= self.max_microsteps() {
                return Err(self.non_terminating(state, steps));
            }

            if let Some(event) = state.queue.pop_front() {
                let selection = self.select(&state.configuration, &event, false, &state.context)?;
                if !selection.is_empty() {
                    let mark = state.actions.len();
                    self.microstep(state, &selection, &event)?;
                    steps += 1;
                    microsteps.push(self.step_snapshot(state, mark));
                }
                last_event = event;
                continue;
            }

            let selection = self.select(&state.configuration, &last_event, true, &state.context)?;
            if selection.is_empty() {
                return Ok(());
            }
            let before = (state.configuration.clone(), state.context.clone());
            let mark = state.actions.len();
            self.microstep(state, &selection, &last_event)?;
            steps += 1;
            microsteps.push(self.step_snapshot(state, mark));

            // an eventless transition that changes nothing would be selected forever
            if state.status == Status::Active
                && state.queue.is_empty()
                && state.configuration == before.0
                && state.context == before.1
            {
                return Err(self.non_terminating(state, steps));
            }
        }
    }

    fn non_terminating(&self, state: &StepState, steps: usize) -> CoreError {
        CoreError::NonTerminating {
            state: self.state_value(&state.configuration).to_string(),
            steps,
        }
    }

    /// Intermediate snapshot after a microstep.
    fn step_snapshot(&self, state: &StepState, actions_from: usize) -> Snapshot {
        Snapshot {
            machine_id: self.id().to_string(),
            value: self.state_value(&state.configuration),
            context: state.context.clone(),
            status: state.status,
            history_actions: state.actions[actions_from..].to_vec(),
            internal_queue: state.queue.iter().cloned().collect(),
            children: state.children.clone(),
            tags: self.tags(&state.configuration),
            output: state.output.clone(),
            error: None,
            changed: true,
        }
    }

    fn commit(
        &self,
        mut state: StepState,
        microsteps: Vec<Snapshot>,
        previous: Option<&Snapshot>,
    ) -> Macrostep {
        if state.status != Status::Active {
            self.teardown(&state.configuration, &mut state.children, &mut state.commands);
        }
        let value = self.state_value(&state.configuration);
        let changed = match previous {
            Some(prev) => {
                prev.value != value
                    || prev.context != state.context
                    || prev.status != state.status
                    || !state.actions.is_empty()
            }
            None => true,
        };
        let snapshot = Snapshot {
            machine_id: self.id().to_string(),
            tags: self.tags(&state.configuration),
            value,
            context: state.context,
            status: state.status,
            history_actions: state.actions,
            internal_queue: state.queue.into_iter().collect(),
            children: state.children,
            output: state.output,
            error: None,
            changed,
        };
        Macrostep {
            snapshot,
            microsteps,
            commands: compact(state.commands),
        }
    }

    /// Discards the partial step and marks the previous snapshot as faulted.
    fn fault(
        &self,
        previous: &Snapshot,
        configuration: &Configuration,
        event: &Event,
        error: &CoreError,
    ) -> Macrostep {
        tracing::warn!(
            machine = %self.id(),
            event = %event,
            code = error.error_code(),
            error = %error,
            "machine faulted"
        );
        let mut snapshot = previous.clone();
        let mut commands = Vec::new();
        self.teardown(configuration, &mut snapshot.children, &mut commands);
        snapshot.status = Status::Error;
        snapshot.error = Some(ErrorInfo {
            code: error.error_code().to_string(),
            message: error.to_string(),
        });
        snapshot.history_actions.clear();
        snapshot.internal_queue.clear();
        snapshot.changed = true;
        Macrostep {
            snapshot,
            microsteps: Vec::new(),
            commands: compact(commands),
        }
    }

    /// Stops every activity of a machine that is no longer active.
    fn teardown(
        &self,
        configuration: &Configuration,
        children: &mut BTreeMap<String, crate::snapshot::ChildRef>,
        commands: &mut Vec<ActorCommand>,
    ) {
        for &index in configuration.iter().rev() {
            self.stop_activities(index, children, commands);
        }
    }
}

impl Macrostep {
    fn unchanged(snapshot: &Snapshot) -> Self {
        let mut snapshot = snapshot.clone();
        snapshot.changed = false;
        snapshot.history_actions.clear();
        Self {
            snapshot,
            microsteps: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Values of the intermediate microsteps, in order.
    pub fn values(&self) -> Vec<String> {
        self.microsteps.iter().map(|s| s.value.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Effect;
    use crate::implementations::Implementations;
    use crate::value::StateValue;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn light() -> Machine {
        Machine::from_json(
            &json!({
                "id": "light",
                "initial": "green",
                "states": {
                    "green": { "on": { "TIMER": "yellow" } },
                    "yellow": { "on": { "TIMER": "red" } },
                    "red": {
                        "initial": "walk",
                        "tags": ["stop"],
                        "on": { "TIMER": "green" },
                        "states": {
                            "walk": { "on": { "PED_COUNTDOWN": "wait" } },
                            "wait": { "on": { "PED_COUNTDOWN": "stop" } },
                            "stop": {}
                        }
                    }
                }
            }),
            Implementations::new(),
        )
        .unwrap()
    }

    fn start(machine: &Machine) -> Snapshot {
        machine.initial_snapshot(None).unwrap().snapshot
    }

    fn send(machine: &Machine, snapshot: &Snapshot, event: &str) -> Snapshot {
        machine
            .transition(snapshot, Event::new(event))
            .unwrap()
            .snapshot
    }

    fn at(machine: &Machine, value: serde_json::Value) -> Snapshot {
        let mut snapshot = start(machine);
        snapshot.value = serde_json::from_value(value).unwrap();
        snapshot
    }

    #[test]
    fn test_light_scenario() {
        let m = light();
        let s = start(&m);
        assert_eq!(s.value, StateValue::from("green"));

        let s = send(&m, &s, "TIMER");
        assert_eq!(s.value, StateValue::from("yellow"));
        assert!(s.changed);

        let s = send(&m, &s, "TIMER");
        assert!(s.matches("red.walk"));
        assert!(s.has_tag("stop"));

        let s = send(&m, &s, "PED_COUNTDOWN");
        let s = send(&m, &s, "PED_COUNTDOWN");
        assert!(s.matches("red.stop"));

        // stop declares nothing; the event bubbles to red
        let s = send(&m, &s, "TIMER");
        assert_eq!(s.value, StateValue::from("green"));
        assert!(!s.has_tag("stop"));

        let s = send(&m, &at(&m, json!({"red": "stop"})), "TIMER");
        assert_eq!(s.value, StateValue::from("green"));
    }

    #[test]
    fn test_unmatched_event_is_noop() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": { "a": { "on": { "NEXT": "b" } }, "b": {} }
            }),
            Implementations::new(),
        )
        .unwrap();
        let s = start(&m);
        let step = m.transition(&s, Event::new("FAKE")).unwrap();
        assert!(!step.snapshot.changed);
        assert_eq!(step.snapshot.value, s.value);
        assert_eq!(step.snapshot.context, s.context);
        assert!(step.microsteps.is_empty());
        assert!(step.commands.is_empty());
    }

    #[test]
    fn test_raise_chaining() {
        let m = Machine::from_json(
            &json!({
                "id": "chain",
                "initial": "start",
                "states": {
                    "start": { "on": { "GO": "a" } },
                    "a": { "entry": { "raise": "NEXT" }, "on": { "NEXT": "b" } },
                    "b": { "always": "c" },
                    "c": { "entry": { "raise": "NEXT" }, "on": { "NEXT": "d" } },
                    "d": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();

        let step = m.transition(&start(&m), Event::new("GO")).unwrap();
        assert_eq!(step.values(), vec!["a", "b", "c", "d"]);
        assert_eq!(step.snapshot.value, StateValue::from("d"));
        assert!(step.snapshot.internal_queue.is_empty());
        assert_eq!(step.snapshot.history_actions, vec!["raise(NEXT)", "raise(NEXT)"]);
    }

    #[test]
    fn test_raised_events_precede_always() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": {
                    "a": {
                        "on": {
                            "GO": {
                                "target": "b",
                                "actions": [{ "raise": "FIRST" }, { "raise": "SECOND" }]
                            }
                        }
                    },
                    "b": { "always": { "target": "wrong", "guard": "ctx.never" }, "on": { "FIRST": "c" } },
                    "c": { "on": { "SECOND": "d" } },
                    "d": {},
                    "wrong": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let step = m.transition(&start(&m), Event::new("GO")).unwrap();
        assert_eq!(step.values(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_forbidden_transition_contained() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "outer",
                "states": {
                    "outer": {
                        "initial": "inner",
                        "on": { "E": "elsewhere" },
                        "states": {
                            "inner": { "on": { "E": { "actions": { "assign": { "seen": true } } } } },
                            "blocked": { "on": { "E": null } },
                            "free": {}
                        }
                    },
                    "elsewhere": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();

        let s = send(&m, &start(&m), "E");
        assert!(s.matches("outer.inner"));
        assert_eq!(s.context, json!({"seen": true}));

        let s = send(&m, &at(&m, json!({"outer": "blocked"})), "E");
        assert!(s.matches("outer.blocked"));

        let s = send(&m, &at(&m, json!({"outer": "free"})), "E");
        assert_eq!(s.value, StateValue::from("elsewhere"));
    }

    #[test]
    fn test_hierarchy_priority_with_guards() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "p",
                "states": {
                    "p": {
                        "initial": "c",
                        "on": { "E": { "target": "outer", "guard": "ctx.ok" } },
                        "states": {
                            "c": { "on": { "E": { "target": "c2", "guard": "ctx.ok" } } },
                            "c2": {}
                        }
                    },
                    "outer": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let mut s = start(&m);
        s.context = json!({"ok": true});
        let s = send(&m, &s, "E");
        assert!(s.matches("p.c2"));
    }

    #[test]
    fn test_parallel_conflict_keeps_previous_snapshot() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "p",
                "states": {
                    "p": {
                        "type": "parallel",
                        "states": {
                            "left": { "initial": "a", "states": { "a": { "on": { "E": "#m.out" } } } },
                            "right": { "initial": "a", "states": { "a": { "on": { "E": "b" } }, "b": {} } }
                        }
                    },
                    "out": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let s = start(&m);
        let result = m.transition(&s, Event::new("E"));
        assert!(matches!(result, Err(CoreError::ConflictingTransitions { .. })));
    }

    #[test]
    fn test_conflict_after_earlier_microstep_aborts_macrostep() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "p",
                "states": {
                    "p": {
                        "type": "parallel",
                        "states": {
                            "left": {
                                "initial": "a",
                                "states": {
                                    "a": { "on": { "GO": { "target": "b", "actions": { "raise": "CLASH" } } } },
                                    "b": {
                                        "after": { "1000": "a" },
                                        "on": { "CLASH": "#m.out" }
                                    }
                                }
                            },
                            "right": {
                                "initial": "a",
                                "states": { "a": { "on": { "CLASH": "b" } }, "b": {} }
                            }
                        }
                    },
                    "out": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let s = start(&m);
        let before = s.clone();

        let result = m.transition(&s, Event::new("GO"));
        assert!(matches!(result, Err(CoreError::ConflictingTransitions { .. })));
        assert_eq!(s, before);

        // the same snapshot still accepts other events
        let step = m.transition(&s, Event::new("NOTHING")).unwrap();
        assert!(!step.snapshot.changed);
        assert!(step.commands.is_empty());
    }

    #[test]
    fn test_self_transition_reenters() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": {
                    "a": {
                        "entry": "enterA",
                        "exit": "exitA",
                        "after": { "500": "b" },
                        "on": { "SELF": "a" }
                    },
                    "b": {}
                }
            }),
            Implementations::new()
                .action("enterA", |_, _| Ok(vec![]))
                .action("exitA", |_, _| Ok(vec![])),
        )
        .unwrap();
        let s = start(&m);

        let step = m.transition(&s, Event::new("SELF")).unwrap();
        assert_eq!(step.snapshot.history_actions, vec!["exitA", "enterA"]);
        assert!(step.snapshot.changed);
        assert_eq!(step.snapshot.value, StateValue::from("a"));
        // the timer is restarted
        assert!(step
            .commands
            .iter()
            .any(|c| matches!(c, ActorCommand::Schedule { .. })));
    }

    #[test]
    fn test_child_target_keeps_source_active() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "p",
                "states": {
                    "p": {
                        "entry": "enterP",
                        "exit": "exitP",
                        "initial": "x",
                        "on": { "INNER": ".y" },
                        "states": { "x": {}, "y": {} }
                    }
                }
            }),
            Implementations::new()
                .action("enterP", |_, _| Ok(vec![]))
                .action("exitP", |_, _| Ok(vec![])),
        )
        .unwrap();
        let s = start(&m);

        let step = m.transition(&s, Event::new("INNER")).unwrap();
        assert!(step.snapshot.matches("p.y"));
        assert!(step.snapshot.history_actions.is_empty());
    }

    #[test]
    fn test_parallel_regions_and_done() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "work",
                "states": {
                    "work": {
                        "type": "parallel",
                        "onDone": "finished",
                        "states": {
                            "upload": {
                                "initial": "pending",
                                "states": {
                                    "pending": { "on": { "UPLOADED": "ok" } },
                                    "ok": { "type": "final" }
                                }
                            },
                            "scan": {
                                "initial": "pending",
                                "states": {
                                    "pending": { "on": { "SCANNED": "ok" } },
                                    "ok": { "type": "final" }
                                }
                            }
                        }
                    },
                    "finished": { "type": "final", "output": { "result": "ready" } }
                }
            }),
            Implementations::new(),
        )
        .unwrap();

        let s = start(&m);
        assert!(s.matches(StateValue::from("work.upload.pending")));

        let s = send(&m, &s, "UPLOADED");
        assert!(s.matches("work.upload.ok"));
        assert!(s.matches("work.scan.pending"));
        assert_eq!(s.status, Status::Active);

        let s = send(&m, &s, "SCANNED");
        assert_eq!(s.value, StateValue::from("finished"));
        assert_eq!(s.status, Status::Done);
        assert_eq!(s.output, Some(json!({"result": "ready"})));

        let after = m.transition(&s, Event::new("UPLOADED")).unwrap();
        assert!(!after.snapshot.changed);
        assert_eq!(after.snapshot.status, Status::Done);
    }

    #[test]
    fn test_compound_on_done() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "form",
                "states": {
                    "form": {
                        "initial": "editing",
                        "onDone": { "target": "submitted", "actions": "record" },
                        "states": {
                            "editing": { "on": { "SUBMIT": "complete" } },
                            "complete": { "type": "final", "output": { "id": 7 } }
                        }
                    },
                    "submitted": {}
                }
            }),
            Implementations::new().action("record", |_, event| {
                Ok(vec![Effect::assign("saved", event.get("output").cloned().unwrap_or_default())])
            }),
        )
        .unwrap();
        let s = send(&m, &start(&m), "SUBMIT");
        assert_eq!(s.value, StateValue::from("submitted"));
        assert_eq!(s.context, json!({"saved": {"id": 7}}));
        assert_eq!(s.status, Status::Active);
    }

    #[test]
    fn test_always_loop_is_non_terminating() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": {
                    "a": { "on": { "GO": "b" } },
                    "b": { "always": { "actions": "noop" } }
                }
            }),
            Implementations::new().action("noop", |_, _| Ok(vec![])),
        )
        .unwrap();
        let s = start(&m);
        let s = send(&m, &s, "GO");
        assert_eq!(s.status, Status::Error);
        assert_eq!(s.value, StateValue::from("a"));
        let error = s.error.unwrap();
        assert_eq!(error.code, "NON_TERMINATING_TRANSITION");
    }

    #[test]
    fn test_ping_pong_hits_microstep_cap() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "idle",
                "states": {
                    "idle": { "on": { "GO": "ping" } },
                    "ping": { "always": "pong" },
                    "pong": { "always": "ping" }
                }
            }),
            Implementations::new(),
        )
        .unwrap()
        .with_max_microsteps(50);
        let step = m.transition(&start(&m), Event::new("GO")).unwrap();
        assert_eq!(step.snapshot.status, Status::Error);
        assert!(step.microsteps.is_empty());
    }

    #[test]
    fn test_counting_always_settles() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "count",
                "context": { "n": 0 },
                "states": {
                    "count": {
                        "always": { "guard": "ctx.n < 5", "actions": "inc" }
                    }
                }
            }),
            Implementations::new().action("inc", |ctx, _| {
                Ok(vec![Effect::assign("n", json!(ctx["n"].as_i64().unwrap_or(0) + 1))])
            }),
        )
        .unwrap();
        let s = start(&m);
        assert_eq!(s.context, json!({"n": 5}));
        assert_eq!(s.status, Status::Active);
    }

    #[test]
    fn test_action_failure_faults_machine() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": {
                    "a": { "on": { "GO": { "target": "b", "actions": "boom" } } },
                    "b": {}
                }
            }),
            Implementations::new().action("boom", |_, _| Err("exploded".into())),
        )
        .unwrap();
        let s = start(&m);
        let s = send(&m, &s, "GO");
        assert_eq!(s.status, Status::Error);
        assert_eq!(s.value, StateValue::from("a"));
        let error = s.error.clone().unwrap();
        assert_eq!(error.code, "UNHANDLED_EXCEPTION_IN_ACTION");
        assert!(error.message.contains("exploded"));

        let after = m.transition(&s, Event::new("GO")).unwrap();
        assert!(!after.snapshot.changed);
    }

    #[test]
    fn test_guard_failure_faults_machine() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": { "a": { "on": { "GO": { "target": "b", "guard": "broken" } } }, "b": {} }
            }),
            Implementations::new().guard("broken", |_, _| Err("no data".into())),
        )
        .unwrap();
        let s = send(&m, &start(&m), "GO");
        assert_eq!(s.status, Status::Error);
    }

    #[test]
    fn test_done_effect_and_output() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "a",
                "states": { "a": { "on": { "QUIT": { "actions": "quit" } } } }
            }),
            Implementations::new().action("quit", |_, _| Ok(vec![Effect::Done(Some(json!(42)))])),
        )
        .unwrap();
        let s = send(&m, &start(&m), "QUIT");
        assert_eq!(s.status, Status::Done);
        assert_eq!(s.output, Some(json!(42)));
    }

    #[test]
    fn test_invocation_lifecycle_commands() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "idle",
                "states": {
                    "idle": { "on": { "FETCH": "loading" } },
                    "loading": {
                        "invoke": { "id": "fetch", "src": "fetchUser", "input": { "id": 1 },
                                    "onDone": { "target": "loaded", "actions": { "assign": { "loaded": true } } },
                                    "onError": "failed" },
                        "after": { "5000": "failed" },
                        "on": { "CANCEL": "idle" }
                    },
                    "loaded": {},
                    "failed": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();

        let step = m.transition(&start(&m), Event::new("FETCH")).unwrap();
        assert_eq!(
            step.commands,
            vec![
                ActorCommand::Schedule {
                    id: "harel.after(5000)#m.loading".to_string(),
                    event: Event::new("harel.after(5000)#m.loading"),
                    delay: Duration::from_millis(5000),
                },
                ActorCommand::Spawn {
                    id: "fetch".to_string(),
                    src: "fetchUser".to_string(),
                    input: json!({"id": 1}),
                    node: "m.loading".to_string(),
                }
            ]
        );
        let loading = step.snapshot;
        assert!(loading.child("fetch").is_some());

        let done = m
            .transition(&loading, Event::done_invoke("fetch", json!({"name": "Ada"})))
            .unwrap();
        assert_eq!(done.snapshot.value, StateValue::from("loaded"));
        assert!(done.snapshot.children.is_empty());
        assert_eq!(
            done.commands,
            vec![
                ActorCommand::Unschedule {
                    id: "harel.after(5000)#m.loading".to_string()
                },
                ActorCommand::Cancel {
                    id: "fetch".to_string()
                }
            ]
        );

        let failed = m
            .transition(&loading, Event::error_invoke("fetch", json!("timeout")))
            .unwrap();
        assert_eq!(failed.snapshot.value, StateValue::from("failed"));

        let cancelled = m.transition(&loading, Event::new("CANCEL")).unwrap();
        assert_eq!(cancelled.snapshot.value, StateValue::from("idle"));
        assert!(cancelled.snapshot.children.is_empty());
    }

    #[test]
    fn test_enter_and_leave_in_one_macrostep() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "idle",
                "states": {
                    "idle": { "on": { "GO": "transient" } },
                    "transient": {
                        "invoke": { "id": "job", "src": "work" },
                        "after": { "10": "idle" },
                        "always": "settled"
                    },
                    "settled": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let step = m.transition(&start(&m), Event::new("GO")).unwrap();
        assert_eq!(step.snapshot.value, StateValue::from("settled"));
        assert!(step.commands.is_empty());
        assert!(step.snapshot.children.is_empty());
    }

    #[test]
    fn test_initial_snapshot_merges_input() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "context": { "a": 1, "b": 2 },
                "entry": { "assign": { "started": true } },
                "states": { "only": {} }
            }),
            Implementations::new(),
        )
        .unwrap();
        let step = m.initial_snapshot(Some(json!({"b": 3}))).unwrap();
        assert_eq!(step.snapshot.context, json!({"a": 1, "b": 3, "started": true}));
        assert_eq!(step.snapshot.history_actions, vec!["assign"]);
        assert!(m.initial_snapshot(Some(json!(5))).is_err());
    }

    #[test]
    fn test_restore_restarts_activities() {
        let m = Machine::from_json(
            &json!({
                "id": "m",
                "initial": "loading",
                "states": {
                    "loading": {
                        "entry": "sideEffect",
                        "invoke": { "id": "fetch", "src": "fetchUser" },
                        "after": { "100": "idle" }
                    },
                    "idle": {}
                }
            }),
            Implementations::new().action("sideEffect", |_, _| Ok(vec![])),
        )
        .unwrap();
        let started = start(&m);
        let json = serde_json::to_value(&started).unwrap();
        let persisted: Snapshot = serde_json::from_value(json).unwrap();

        let restored = m.restore(&persisted).unwrap();
        assert!(restored.snapshot.history_actions.is_empty());
        assert!(restored.snapshot.children.contains_key("fetch"));
        assert_eq!(restored.commands.len(), 2);

        let mut bogus = persisted.clone();
        bogus.value = StateValue::from("nowhere");
        assert!(matches!(m.restore(&bogus), Err(CoreError::InvalidState { .. })));
    }

    #[test]
    fn test_snapshot_of_other_machine_rejected() {
        let m = light();
        let mut s = start(&m);
        s.machine_id = "other".to_string();
        assert!(matches!(
            m.transition(&s, Event::new("TIMER")),
            Err(CoreError::InvalidState { .. })
        ));
    }

    const EVENTS: &[&str] = &["TIMER", "PED_COUNTDOWN", "FAKE"];

    proptest! {
        #[test]
        fn prop_deterministic_and_complete(indices in proptest::collection::vec(0usize..3, 0..20)) {
            let m = light();
            let mut s = start(&m);
            for i in indices {
                let a = m.transition(&s, Event::new(EVENTS[i])).unwrap().snapshot;
                let b = m.transition(&s, Event::new(EVENTS[i])).unwrap().snapshot;
                prop_assert_eq!(&a.value, &b.value);
                prop_assert_eq!(&a.context, &b.context);

                let resolved = m.resolve(crate::value::StateDescriptor::Value(a.value.clone())).unwrap();
                prop_assert_eq!(&resolved, &a.value);
                s = a;
            }
        }

        #[test]
        fn prop_unmatched_event_is_idempotent(indices in proptest::collection::vec(0usize..2, 0..10)) {
            let m = light();
            let mut s = start(&m);
            for i in indices {
                s = m.transition(&s, Event::new(EVENTS[i])).unwrap().snapshot;
            }
            let after = m.transition(&s, Event::new("UNKNOWN")).unwrap().snapshot;
            prop_assert!(!after.changed);
            prop_assert_eq!(&after.value, &s.value);
        }
    }
}
