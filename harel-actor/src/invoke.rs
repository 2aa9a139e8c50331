//! Running invocations and delayed events owned by one actor.
//!
//! Every spawned task, callback, child actor and timer is tracked under its
//! id together with a generation number. Results are posted back to the
//! owner's mailbox tagged with that generation; a result whose generation no
//! longer matches the tracked entry belongs to a cancelled or superseded run
//! and is discarded.

use crate::actor::{Actor, Message, ParentLink};
use crate::config::ActorConfig;
use crate::logic::{ActorLogic, ActorRegistry, CallbackHandle};
use dashmap::DashMap;
use harel_core::{ActorCommand, Event, Snapshot, Status};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Running {
    generation: u64,
    task: Option<JoinHandle<()>>,
    inbox: Option<mpsc::UnboundedSender<Event>>,
    actor: Option<Actor>,
}

impl Running {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            task: None,
            inbox: None,
            actor: None,
        }
    }

    fn stop(self) {
        if let Some(task) = self.task {
            task.abort();
        }
        if let Some(actor) = self.actor {
            actor.stop_detached();
        }
    }
}

pub(crate) struct InvocationManager {
    owner: String,
    registry: Arc<ActorRegistry>,
    config: ActorConfig,
    mailbox: mpsc::UnboundedSender<Message>,
    parent: Option<ParentLink>,
    running: HashMap<String, Running>,
    /// Child actors, shared with the owner's handle for `Actor::child`.
    children: Arc<DashMap<String, Actor>>,
    next_generation: u64,
}

impl InvocationManager {
    pub(crate) fn new(
        owner: String,
        registry: Arc<ActorRegistry>,
        config: ActorConfig,
        mailbox: mpsc::UnboundedSender<Message>,
        parent: Option<ParentLink>,
        children: Arc<DashMap<String, Actor>>,
    ) -> Self {
        Self {
            owner,
            registry,
            config,
            mailbox,
            parent,
            running: HashMap::new(),
            children,
            next_generation: 0,
        }
    }

    pub(crate) fn execute(&mut self, commands: Vec<ActorCommand>) {
        for command in commands {
            match command {
                ActorCommand::Spawn { id, src, input, .. } => self.spawn(id, &src, input),
                ActorCommand::Cancel { id } | ActorCommand::Unschedule { id } => self.cancel(&id),
                ActorCommand::Schedule { id, event, delay } => self.schedule(id, event, delay),
                ActorCommand::SendParent(event) => self.send_parent(event),
                ActorCommand::SendTo { id, event } => self.send_to(&id, event),
            }
        }
    }

    /// Checks a result posted to the mailbox against the tracked entry.
    ///
    /// Completing results retire the entry.
    pub(crate) fn accept(&mut self, id: &str, generation: u64, completes: bool) -> bool {
        match self.running.get(id) {
            Some(running) if running.generation == generation => {
                if completes {
                    self.running.remove(id);
                    self.children.remove(id);
                }
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self, id: &str) -> bool {
        self.running.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.running.len()
    }

    /// Cancels every invocation and timer.
    pub(crate) fn cancel_all(&mut self) {
        for (id, running) in self.running.drain() {
            debug!(actor = %self.owner, id = %id, "cancelling");
            running.stop();
        }
        self.children.clear();
    }

    /// Tears everything down after the owner reached a final status and
    /// reports the outcome to the parent.
    pub(crate) fn finish(&mut self, snapshot: &Snapshot) {
        self.cancel_all();
        let Some(parent) = &self.parent else {
            return;
        };
        let event = match snapshot.status {
            Status::Done => {
                Event::done_invoke(&parent.id, snapshot.output.clone().unwrap_or(Value::Null))
            }
            Status::Error => {
                let error = snapshot
                    .error
                    .as_ref()
                    .map(|e| json!({"code": e.code, "message": e.message}))
                    .unwrap_or(Value::Null);
                Event::error_invoke(&parent.id, error)
            }
            Status::Active | Status::Stopped => return,
        };
        parent.post(event, true);
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn spawn(&mut self, id: String, src: &str, input: Value) {
        self.cancel(&id);
        let generation = self.next_generation();

        let Some(logic) = self.registry.get(src).cloned() else {
            warn!(actor = %self.owner, id = %id, src = %src, "unknown invocation source");
            self.running.insert(id.clone(), Running::new(generation));
            let error = json!(format!("unknown invocation source '{}'", src));
            self.post(id.clone(), generation, Event::error_invoke(&id, error), true);
            return;
        };

        debug!(actor = %self.owner, id = %id, src = %src, kind = logic.kind(), generation, "spawning");
        let mut running = Running::new(generation);
        match logic {
            ActorLogic::Task(task) => {
                running.task = Some(self.run_to_completion(id.clone(), generation, task(input)));
            }
            ActorLogic::Callback(callback) => {
                let (inbox, receiver) = mpsc::unbounded_channel();
                let handle =
                    CallbackHandle::new(id.clone(), generation, self.mailbox.clone(), receiver);
                running.inbox = Some(inbox);
                running.task = Some(self.run_to_completion(
                    id.clone(),
                    generation,
                    callback(input, handle),
                ));
            }
            ActorLogic::Machine(machine) => {
                let link = ParentLink {
                    mailbox: self.mailbox.clone(),
                    id: id.clone(),
                    generation,
                };
                let input = (!input.is_null()).then_some(input);
                match Actor::spawn_child(
                    machine,
                    self.registry.clone(),
                    self.config.clone(),
                    id.clone(),
                    input,
                    link,
                ) {
                    Ok(actor) => {
                        self.children.insert(id.clone(), actor.clone());
                        running.actor = Some(actor);
                    }
                    Err(e) => {
                        warn!(actor = %self.owner, id = %id, error = %e, "child actor failed to start");
                        let error = json!({"code": e.error_code(), "message": e.to_string()});
                        self.post(id.clone(), generation, Event::error_invoke(&id, error), true);
                    }
                }
            }
        }
        self.running.insert(id.clone(), running);

        // Children start after registration so a child that finishes
        // immediately still finds its entry.
        if let Some(actor) = self.children.get(&id).map(|a| a.clone()) {
            if let Err(e) = actor.start() {
                warn!(actor = %self.owner, id = %id, error = %e, "child actor failed to start");
            }
        }
    }

    fn run_to_completion(
        &self,
        id: String,
        generation: u64,
        future: futures::future::BoxFuture<'static, Result<Value, Value>>,
    ) -> JoinHandle<()> {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let event = match future.await {
                Ok(output) => Event::done_invoke(&id, output),
                Err(error) => Event::error_invoke(&id, error),
            };
            let _ = mailbox.send(Message::Child {
                id,
                generation,
                event,
                completes: true,
            });
        })
    }

    fn schedule(&mut self, id: String, event: Event, delay: Duration) {
        self.cancel(&id);
        let generation = self.next_generation();
        let mailbox = self.mailbox.clone();
        let timer_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(Message::Child {
                id: timer_id,
                generation,
                event,
                completes: true,
            });
        });
        debug!(actor = %self.owner, id = %id, delay_ms = delay.as_millis() as u64, "timer scheduled");
        let mut running = Running::new(generation);
        running.task = Some(task);
        self.running.insert(id, running);
    }

    fn cancel(&mut self, id: &str) {
        if let Some(running) = self.running.remove(id) {
            debug!(actor = %self.owner, id = %id, generation = running.generation, "cancelling");
            running.stop();
        }
        self.children.remove(id);
    }

    fn send_parent(&self, event: Event) {
        match &self.parent {
            Some(parent) => {
                if !parent.post(event, false) {
                    warn!(actor = %self.owner, "parent is gone; event dropped");
                }
            }
            None => warn!(actor = %self.owner, event = %event, "sendParent from a root actor"),
        }
    }

    fn send_to(&self, id: &str, event: Event) {
        let Some(running) = self.running.get(id) else {
            warn!(actor = %self.owner, id = %id, event = %event, "no running invocation");
            return;
        };
        if let Some(inbox) = &running.inbox {
            if inbox.send(event).is_err() {
                warn!(actor = %self.owner, id = %id, "invocation inbox closed");
            }
        } else if let Some(actor) = &running.actor {
            actor.send(event);
        } else {
            warn!(actor = %self.owner, id = %id, event = %event, "invocation does not accept events");
        }
    }

    fn post(&self, id: String, generation: u64, event: Event, completes: bool) {
        let _ = self.mailbox.send(Message::Child {
            id,
            generation,
            event,
            completes,
        });
    }
}
