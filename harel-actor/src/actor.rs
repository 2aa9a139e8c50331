//! Actor: a running machine instance with a mailbox.
//!
//! Each started actor owns one tokio task that drains its mailbox. Messages
//! are processed strictly one at a time: the task computes the next snapshot
//! with the core, executes the resulting commands through its
//! [`InvocationManager`], stores the snapshot and publishes it, then moves
//! on. The loop ends when the actor is stopped or reaches a final status;
//! messages arriving after that are dropped.

use crate::broadcast::{InspectionEvent, InspectionKind, SnapshotBroadcaster, Subscription};
use crate::config::ActorConfig;
use crate::error::ActorError;
use crate::invoke::InvocationManager;
use crate::logic::ActorRegistry;
use dashmap::DashMap;
use harel_core::{ActorCommand, Event, Machine, Macrostep, Snapshot, Status};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Label used when publishing the snapshot produced by `stop`.
const STOP_EVENT: &str = "harel.stop";

type Reply = oneshot::Sender<Result<Arc<Snapshot>, ActorError>>;

/// Mailbox message.
#[derive(Debug)]
pub(crate) enum Message {
    /// External event, optionally awaiting the resulting snapshot.
    Send { event: Event, reply: Option<Reply> },
    /// Event from an invocation or timer owned by this actor.
    Child {
        id: String,
        generation: u64,
        event: Event,
        /// Whether the event is the invocation's final result.
        completes: bool,
    },
    Stop {
        reply: Option<oneshot::Sender<Arc<Snapshot>>>,
    },
}

/// How a child actor reaches the actor that invoked it.
pub(crate) struct ParentLink {
    pub(crate) mailbox: mpsc::UnboundedSender<Message>,
    /// Invocation id in the parent.
    pub(crate) id: String,
    pub(crate) generation: u64,
}

impl ParentLink {
    pub(crate) fn post(&self, event: Event, completes: bool) -> bool {
        self.mailbox
            .send(Message::Child {
                id: self.id.clone(),
                generation: self.generation,
                event,
                completes,
            })
            .is_ok()
    }
}

/// State held until `start` hands it to the mailbox task.
struct Startup {
    receiver: mpsc::UnboundedReceiver<Message>,
    manager: InvocationManager,
    commands: Vec<ActorCommand>,
}

enum Origin<'a> {
    Input(Option<Value>),
    Restore(&'a Snapshot),
}

struct ActorInner {
    id: String,
    machine: Arc<Machine>,
    snapshot: RwLock<Arc<Snapshot>>,
    broadcaster: Arc<SnapshotBroadcaster>,
    mailbox: mpsc::UnboundedSender<Message>,
    startup: Mutex<Option<Startup>>,
    children: Arc<DashMap<String, Actor>>,
    trace_microsteps: bool,
}

/// Handle to a running machine. Cheap to clone.
#[derive(Clone)]
pub struct Actor {
    inner: Arc<ActorInner>,
}

impl Actor {
    /// Creates an actor in the machine's initial state. Entry actions have
    /// run, but no invocation or timer starts until [`Actor::start`].
    pub fn new(
        machine: Arc<Machine>,
        registry: ActorRegistry,
        config: ActorConfig,
    ) -> Result<Self, ActorError> {
        Self::build(machine, Arc::new(registry), config, None, Origin::Input(None), None)
    }

    /// Like [`Actor::new`], merging `input` into the initial context.
    pub fn with_input(
        machine: Arc<Machine>,
        registry: ActorRegistry,
        config: ActorConfig,
        input: Value,
    ) -> Result<Self, ActorError> {
        Self::build(
            machine,
            Arc::new(registry),
            config,
            None,
            Origin::Input(Some(input)),
            None,
        )
    }

    /// Creates an actor from a persisted snapshot. Activities of the active
    /// states are started afresh on [`Actor::start`].
    pub fn restore(
        machine: Arc<Machine>,
        registry: ActorRegistry,
        config: ActorConfig,
        snapshot: &Snapshot,
    ) -> Result<Self, ActorError> {
        Self::build(
            machine,
            Arc::new(registry),
            config,
            None,
            Origin::Restore(snapshot),
            None,
        )
    }

    pub(crate) fn spawn_child(
        machine: Arc<Machine>,
        registry: Arc<ActorRegistry>,
        config: ActorConfig,
        id: String,
        input: Option<Value>,
        parent: ParentLink,
    ) -> Result<Self, ActorError> {
        Self::build(
            machine,
            registry,
            config,
            Some(id),
            Origin::Input(input),
            Some(parent),
        )
    }

    fn build(
        machine: Arc<Machine>,
        registry: Arc<ActorRegistry>,
        config: ActorConfig,
        id: Option<String>,
        origin: Origin<'_>,
        parent: Option<ParentLink>,
    ) -> Result<Self, ActorError> {
        config.validate()?;
        let machine = if machine.max_microsteps() == config.max_microsteps {
            machine
        } else {
            Arc::new(
                Machine::clone(&machine).with_max_microsteps(config.max_microsteps),
            )
        };

        let macrostep = match origin {
            Origin::Input(input) => machine.initial_snapshot(input)?,
            Origin::Restore(snapshot) => machine.restore(snapshot)?,
        };

        let id = id.unwrap_or_else(|| machine.id().to_string());
        let (mailbox, receiver) = mpsc::unbounded_channel();
        let children = Arc::new(DashMap::new());
        let manager = InvocationManager::new(
            id.clone(),
            registry,
            config.clone(),
            mailbox.clone(),
            parent,
            children.clone(),
        );

        Ok(Self {
            inner: Arc::new(ActorInner {
                id,
                machine,
                snapshot: RwLock::new(Arc::new(macrostep.snapshot)),
                broadcaster: Arc::new(SnapshotBroadcaster::new(config.subscriber_capacity)),
                mailbox,
                startup: Mutex::new(Some(Startup {
                    receiver,
                    manager,
                    commands: macrostep.commands,
                })),
                children,
                trace_microsteps: config.trace_microsteps,
            }),
        })
    }

    /// Actor id: the machine id for root actors, the invocation id for
    /// children.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.inner.machine
    }

    /// Starts pending activities and the mailbox task. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) -> Result<(), ActorError> {
        let startup = self.inner.startup.lock().take();
        let Some(Startup {
            receiver,
            mut manager,
            commands,
        }) = startup
        else {
            if self.get_snapshot().status == Status::Stopped {
                return Err(ActorError::Stopped(self.inner.id.clone()));
            }
            return Err(ActorError::AlreadyStarted(self.inner.id.clone()));
        };

        let snapshot = self.get_snapshot();
        info!(
            actor = %self.inner.id,
            machine = %self.inner.machine.id(),
            state = %snapshot.value,
            "actor started"
        );
        manager.execute(commands);
        self.inner
            .broadcaster
            .publish(&self.inner.id, &Event::init().event_type, snapshot.clone());

        if snapshot.is_terminal() {
            self.inner.finished(&mut manager, &snapshot);
            return Ok(());
        }

        tokio::spawn(run(self.inner.clone(), receiver, manager));
        Ok(())
    }

    /// Enqueues an event. Events sent before `start` are processed once the
    /// actor starts; events sent after it stops are ignored.
    pub fn send(&self, event: impl Into<Event>) {
        let event = event.into();
        if let Err(mpsc::error::SendError(Message::Send { event, .. })) =
            self.inner.mailbox.send(Message::Send { event, reply: None })
        {
            debug!(actor = %self.inner.id, event = %event, "actor is not running; event ignored");
        }
    }

    /// Enqueues an event and waits for the snapshot it produces.
    ///
    /// Conflicting transitions are returned as errors and leave the current
    /// snapshot in place. An actor that is no longer running answers with
    /// its last snapshot.
    pub async fn send_and_wait(&self, event: impl Into<Event>) -> Result<Arc<Snapshot>, ActorError> {
        if self.inner.startup.lock().is_some() {
            return Err(ActorError::NotStarted(self.inner.id.clone()));
        }
        let (reply, rx) = oneshot::channel();
        let message = Message::Send {
            event: event.into(),
            reply: Some(reply),
        };
        if self.inner.mailbox.send(message).is_err() {
            return Ok(self.get_snapshot());
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(self.get_snapshot()),
        }
    }

    /// Returns the latest committed snapshot.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().clone()
    }

    /// Registers an observer called with every published snapshot, in
    /// order, from the actor's task.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Arc<Snapshot>) + Send + Sync + 'static,
    {
        let id = self.inner.broadcaster.subscribe(Arc::new(observer));
        Subscription::new(id, &self.inner.broadcaster)
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.inner.broadcaster.subscribe_channel()
    }

    /// Receives settled snapshots and, when `trace_microsteps` is enabled,
    /// every intermediate microstep.
    pub fn inspect(&self) -> broadcast::Receiver<InspectionEvent> {
        self.inner.broadcaster.inspect()
    }

    /// Waits until a snapshot satisfies `predicate`.
    ///
    /// Fails with [`ActorError::Stopped`] if the actor reaches a final
    /// status that does not satisfy it.
    pub async fn wait_for<P>(&self, predicate: P) -> Result<Arc<Snapshot>, ActorError>
    where
        P: Fn(&Snapshot) -> bool,
    {
        let mut rx = self.subscribe_channel();
        let current = self.get_snapshot();
        if predicate(&current) {
            return Ok(current);
        }
        if current.is_terminal() {
            return Err(ActorError::Stopped(self.inner.id.clone()));
        }

        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    if predicate(&snapshot) {
                        return Ok(snapshot);
                    }
                    if snapshot.is_terminal() {
                        return Err(ActorError::Stopped(self.inner.id.clone()));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(actor = %self.inner.id, skipped, "wait_for lagged behind");
                    let snapshot = self.get_snapshot();
                    if predicate(&snapshot) {
                        return Ok(snapshot);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ActorError::Stopped(self.inner.id.clone()));
                }
            }
        }
    }

    /// Stops the actor, cancelling every invocation and timer. Returns the
    /// final snapshot; an actor that already finished keeps its status.
    pub async fn stop(&self) -> Arc<Snapshot> {
        let startup = self.inner.startup.lock().take();
        if let Some(Startup { mut manager, .. }) = startup {
            return self.inner.halt(&mut manager);
        }

        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .mailbox
            .send(Message::Stop { reply: Some(reply) })
            .is_err()
        {
            return self.get_snapshot();
        }
        rx.await.unwrap_or_else(|_| self.get_snapshot())
    }

    pub(crate) fn stop_detached(&self) {
        let startup = self.inner.startup.lock().take();
        if let Some(Startup { mut manager, .. }) = startup {
            self.inner.halt(&mut manager);
            return;
        }
        let _ = self.inner.mailbox.send(Message::Stop { reply: None });
    }

    /// Returns a running child actor spawned from machine logic.
    pub fn child(&self, id: &str) -> Option<Actor> {
        self.inner.children.get(id).map(|child| child.clone())
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("id", &self.inner.id)
            .field("machine", &self.inner.machine.id())
            .field("status", &self.get_snapshot().status)
            .finish()
    }
}

impl ActorInner {
    fn process(
        &self,
        manager: &mut InvocationManager,
        event: Event,
    ) -> Result<Arc<Snapshot>, ActorError> {
        let current = self.snapshot.read().clone();
        let event_type = event.event_type.clone();
        let macrostep = self.machine.transition(&current, event)?;
        Ok(self.commit(manager, macrostep, &event_type))
    }

    fn commit(
        &self,
        manager: &mut InvocationManager,
        macrostep: Macrostep,
        event: &str,
    ) -> Arc<Snapshot> {
        let Macrostep {
            snapshot,
            microsteps,
            commands,
        } = macrostep;

        if self.trace_microsteps && self.broadcaster.has_inspectors() {
            for step in microsteps {
                self.broadcaster.notify_inspectors(
                    &self.id,
                    event,
                    InspectionKind::Microstep,
                    Arc::new(step),
                );
            }
        }

        manager.execute(commands);
        let snapshot = Arc::new(snapshot);
        *self.snapshot.write() = snapshot.clone();
        self.broadcaster.publish(&self.id, event, snapshot.clone());

        if snapshot.is_terminal() {
            self.finished(manager, &snapshot);
        }
        snapshot
    }

    fn finished(&self, manager: &mut InvocationManager, snapshot: &Snapshot) {
        match &snapshot.error {
            Some(error) => warn!(
                actor = %self.id,
                code = %error.code,
                error = %error.message,
                "actor failed"
            ),
            None => info!(actor = %self.id, status = %snapshot.status, "actor finished"),
        }
        manager.finish(snapshot);
    }

    fn halt(&self, manager: &mut InvocationManager) -> Arc<Snapshot> {
        let cancelled = manager.len();
        manager.cancel_all();

        let current = self.snapshot.read().clone();
        if current.is_terminal() {
            return current;
        }

        let mut stopped = Snapshot::clone(&current);
        stopped.status = Status::Stopped;
        stopped.children.clear();
        stopped.history_actions.clear();
        stopped.changed = true;
        let stopped = Arc::new(stopped);
        *self.snapshot.write() = stopped.clone();
        self.broadcaster.publish(&self.id, STOP_EVENT, stopped.clone());

        info!(actor = %self.id, cancelled, "actor stopped");
        stopped
    }
}

async fn run(
    inner: Arc<ActorInner>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    mut manager: InvocationManager,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Send { event, reply } => {
                let result = inner.process(&mut manager, event);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(actor = %inner.id, error = %e, "event rejected");
                        }
                    }
                }
            }
            Message::Child {
                id,
                generation,
                event,
                completes,
            } => {
                if !manager.accept(&id, generation, completes) {
                    debug!(
                        actor = %inner.id,
                        id = %id,
                        generation,
                        event = %event,
                        "discarding event from cancelled invocation"
                    );
                    continue;
                }
                if let Err(e) = inner.process(&mut manager, event) {
                    warn!(actor = %inner.id, id = %id, error = %e, "event rejected");
                }
            }
            Message::Stop { reply } => {
                let snapshot = inner.halt(&mut manager);
                if let Some(reply) = reply {
                    let _ = reply.send(snapshot);
                }
                break;
            }
        }

        if inner.snapshot.read().is_terminal() {
            break;
        }
    }
    debug!(actor = %inner.id, "mailbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::ActorLogic;
    use harel_core::{Effect, Implementations};
    use serde_json::json;
    use std::time::Duration;

    fn light() -> Arc<Machine> {
        let machine = Machine::from_json(
            &json!({
                "id": "light",
                "initial": "green",
                "states": {
                    "green": { "on": { "TIMER": "yellow" } },
                    "yellow": {
                        "on": { "TIMER": "red" },
                        "after": { "1000": "red" }
                    },
                    "red": { "on": { "TIMER": "green" } }
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        Arc::new(machine)
    }

    fn store_output() -> Implementations {
        Implementations::new().action("store", |_, event| {
            Ok(vec![Effect::assign(
                "result",
                event.get("output").cloned().unwrap_or(Value::Null),
            )])
        })
    }

    fn fetcher() -> Arc<Machine> {
        let machine = Machine::from_json(
            &json!({
                "id": "fetcher",
                "initial": "idle",
                "states": {
                    "idle": { "on": { "FETCH": "loading" } },
                    "loading": {
                        "invoke": {
                            "id": "fetch",
                            "src": "fetch",
                            "input": { "n": 2 },
                            "onDone": { "target": "success", "actions": "store" },
                            "onError": "failure"
                        },
                        "on": { "CANCEL": "idle" }
                    },
                    "success": { "type": "final" },
                    "failure": {}
                }
            }),
            store_output(),
        )
        .unwrap();
        Arc::new(machine)
    }

    fn doubler(delay: Duration) -> ActorRegistry {
        ActorRegistry::new().register(
            "fetch",
            ActorLogic::task(move |input| async move {
                tokio::time::sleep(delay).await;
                let n = input["n"].as_i64().unwrap_or(0);
                Ok(json!({ "n": n * 2 }))
            }),
        )
    }

    #[tokio::test]
    async fn test_send_and_wait() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        assert!(matches!(
            actor.send_and_wait("TIMER").await,
            Err(ActorError::NotStarted(_))
        ));

        actor.start().unwrap();
        assert!(matches!(actor.start(), Err(ActorError::AlreadyStarted(_))));

        let snapshot = actor.send_and_wait("TIMER").await.unwrap();
        assert!(snapshot.matches("yellow"));
        let snapshot = actor.send_and_wait("UNKNOWN").await.unwrap();
        assert!(snapshot.matches("yellow"));
        assert!(!snapshot.changed);
        assert!(actor.get_snapshot().matches("yellow"));

        let stopped = actor.stop().await;
        assert_eq!(stopped.status, Status::Stopped);
    }

    #[tokio::test]
    async fn test_events_sent_before_start_are_queued() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        actor.send("TIMER");
        actor.send("TIMER");
        actor.start().unwrap();
        let snapshot = actor.wait_for(|s| s.matches("red")).await.unwrap();
        assert_eq!(snapshot.value.to_string(), "red");
    }

    #[tokio::test]
    async fn test_subscribe_delivers_in_order() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = actor.subscribe(move |s| sink.lock().push(s.value.to_string()));

        actor.start().unwrap();
        actor.send_and_wait("TIMER").await.unwrap();
        actor.send_and_wait("TIMER").await.unwrap();
        assert_eq!(*seen.lock(), vec!["green", "yellow", "red"]);

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        actor.send_and_wait("TIMER").await.unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_transition() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        actor.start().unwrap();
        actor.send_and_wait("TIMER").await.unwrap();

        let started = tokio::time::Instant::now();
        let snapshot = actor.wait_for(|s| s.matches("red")).await.unwrap();
        assert!(snapshot.matches("red"));
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_state_cancels_timer() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        actor.start().unwrap();
        actor.send_and_wait("TIMER").await.unwrap();
        actor.send_and_wait("TIMER").await.unwrap();
        actor.send_and_wait("TIMER").await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        let snapshot = actor.send_and_wait("PING").await.unwrap();
        assert!(snapshot.matches("green"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_invocation_done() {
        let actor = Actor::new(
            fetcher(),
            doubler(Duration::from_millis(50)),
            ActorConfig::default(),
        )
        .unwrap();
        actor.start().unwrap();
        let snapshot = actor.send_and_wait("FETCH").await.unwrap();
        assert!(snapshot.matches("loading"));
        assert!(snapshot.child("fetch").is_some());

        let done = actor.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(done.status, Status::Done);
        assert_eq!(done.context["result"], json!({"n": 4}));
        assert!(done.children.is_empty());

        // ignored once done
        let after = actor.send_and_wait("FETCH").await.unwrap();
        assert_eq!(after.status, Status::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_invocation_error() {
        let registry = ActorRegistry::new().register(
            "fetch",
            ActorLogic::task(|_| async { Err(json!("unreachable")) }),
        );
        let actor = Actor::new(fetcher(), registry, ActorConfig::default()).unwrap();
        actor.start().unwrap();
        actor.send("FETCH");
        let snapshot = actor.wait_for(|s| s.matches("failure")).await.unwrap();
        assert!(snapshot.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_source_raises_error_event() {
        let actor = Actor::new(fetcher(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        actor.start().unwrap();
        actor.send("FETCH");
        let snapshot = actor.wait_for(|s| s.matches("failure")).await.unwrap();
        assert!(snapshot.children.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_invocation_result_is_discarded() {
        let actor = Actor::new(
            fetcher(),
            doubler(Duration::from_millis(100)),
            ActorConfig::default(),
        )
        .unwrap();
        actor.start().unwrap();
        actor.send_and_wait("FETCH").await.unwrap();
        let snapshot = actor.send_and_wait("CANCEL").await.unwrap();
        assert!(snapshot.matches("idle"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = actor.send_and_wait("PING").await.unwrap();
        assert!(snapshot.matches("idle"));
        assert!(snapshot.context.get("result").is_none());
    }

    #[tokio::test]
    async fn test_nested_machine_child() {
        let child = Machine::from_json(
            &json!({
                "id": "child",
                "initial": "working",
                "states": {
                    "working": {
                        "entry": { "sendParent": "CHILD_READY" },
                        "on": { "FINISH": "finished" }
                    },
                    "finished": { "type": "final", "output": { "answer": 42 } }
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let parent = Machine::from_json(
            &json!({
                "id": "parent",
                "initial": "running",
                "states": {
                    "running": {
                        "invoke": {
                            "id": "worker",
                            "src": "child",
                            "onDone": { "target": "complete", "actions": "store" }
                        },
                        "on": { "CHILD_READY": { "actions": { "assign": { "ready": true } } } }
                    },
                    "complete": { "type": "final" }
                }
            }),
            store_output(),
        )
        .unwrap();

        let registry = ActorRegistry::new().register("child", ActorLogic::machine(child));
        let actor = Actor::new(Arc::new(parent), registry, ActorConfig::default()).unwrap();
        actor.start().unwrap();

        actor
            .wait_for(|s| s.context.get("ready") == Some(&json!(true)))
            .await
            .unwrap();
        let worker = actor.child("worker").unwrap();
        assert_eq!(worker.id(), "worker");
        assert!(worker.get_snapshot().matches("working"));

        worker.send("FINISH");
        let done = actor.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(done.status, Status::Done);
        assert_eq!(done.context["result"], json!({"answer": 42}));
        assert_eq!(worker.get_snapshot().status, Status::Done);
        assert!(actor.child("worker").is_none());
    }

    #[tokio::test]
    async fn test_callback_send_to_and_send_parent() {
        let machine = Machine::from_json(
            &json!({
                "id": "pinger",
                "initial": "listening",
                "states": {
                    "listening": {
                        "invoke": { "id": "listener", "src": "listener" },
                        "on": {
                            "PING": { "actions": "ping" },
                            "PONG": { "actions": { "assign": { "ponged": true } } }
                        }
                    }
                }
            }),
            Implementations::new().action("ping", |_, _| {
                Ok(vec![Effect::SendTo {
                    id: "listener".to_string(),
                    event: Event::new("PING"),
                }])
            }),
        )
        .unwrap();
        let registry = ActorRegistry::new().register(
            "listener",
            ActorLogic::callback(|_, mut handle| async move {
                while let Some(event) = handle.recv().await {
                    if event.event_type == "PING" {
                        handle.send_parent("PONG");
                    }
                }
                Ok(Value::Null)
            }),
        );

        let actor = Actor::new(Arc::new(machine), registry, ActorConfig::default()).unwrap();
        actor.start().unwrap();
        actor.send("PING");
        let snapshot = actor
            .wait_for(|s| s.context.get("ponged") == Some(&json!(true)))
            .await
            .unwrap();
        assert!(snapshot.child("listener").is_some());

        let stopped = actor.stop().await;
        assert_eq!(stopped.status, Status::Stopped);
        assert!(stopped.children.is_empty());
    }

    #[tokio::test]
    async fn test_fault_stops_processing() {
        let machine = Machine::from_json(
            &json!({
                "id": "fragile",
                "initial": "ok",
                "states": {
                    "ok": { "on": { "BOOM": { "target": "broken", "actions": "explode" } } },
                    "broken": {}
                }
            }),
            Implementations::new().action("explode", |_, _| Err("kaboom".into())),
        )
        .unwrap();
        let actor = Actor::new(Arc::new(machine), ActorRegistry::new(), ActorConfig::default())
            .unwrap();
        actor.start().unwrap();

        let snapshot = actor.send_and_wait("BOOM").await.unwrap();
        assert_eq!(snapshot.status, Status::Error);
        assert!(snapshot.matches("ok"));
        assert_eq!(
            snapshot.error.as_ref().unwrap().code,
            "UNHANDLED_EXCEPTION_IN_ACTION"
        );

        let again = actor.send_and_wait("BOOM").await.unwrap();
        assert_eq!(again.status, Status::Error);
        assert!(matches!(
            actor.wait_for(|s| s.matches("broken")).await,
            Err(ActorError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_is_returned_and_state_kept() {
        let machine = Machine::from_json(
            &json!({
                "id": "regions",
                "type": "parallel",
                "states": {
                    "left": {
                        "initial": "a",
                        "states": { "a": { "on": { "GO": "#regions.right.b" } }, "b": {} }
                    },
                    "right": {
                        "initial": "a",
                        "states": { "a": { "on": { "GO": "b" } }, "b": {} }
                    }
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let actor = Actor::new(Arc::new(machine), ActorRegistry::new(), ActorConfig::default())
            .unwrap();
        actor.start().unwrap();
        let before = actor.get_snapshot();

        let err = actor.send_and_wait("GO").await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICTING_TRANSITIONS");
        assert_eq!(actor.get_snapshot(), before);
        assert!(actor.get_snapshot().is_active());
    }

    #[tokio::test]
    async fn test_conflict_on_raised_event_executes_nothing() {
        let machine = Machine::from_json(
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
                                        "invoke": { "id": "job", "src": "worker" },
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
        let spawned = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = spawned.clone();
        let registry = ActorRegistry::new().register(
            "worker",
            ActorLogic::task(move |input| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok(input) }
            }),
        );
        let actor = Actor::new(Arc::new(machine), registry, ActorConfig::default()).unwrap();
        actor.start().unwrap();
        let before = actor.get_snapshot();

        let err = actor.send_and_wait("GO").await.unwrap_err();
        assert_eq!(err.error_code(), "CONFLICTING_TRANSITIONS");
        assert_eq!(actor.get_snapshot(), before);
        assert_eq!(spawned.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(actor.child("job").is_none());
        assert!(actor.get_snapshot().children.is_empty());
    }

    #[tokio::test]
    async fn test_inspect_microsteps() {
        let machine = Machine::from_json(
            &json!({
                "id": "chain",
                "initial": "a",
                "states": {
                    "a": { "on": { "GO": { "target": "b", "actions": { "raise": "NEXT" } } } },
                    "b": { "on": { "NEXT": "c" } },
                    "c": {}
                }
            }),
            Implementations::new(),
        )
        .unwrap();
        let config = ActorConfig {
            trace_microsteps: true,
            ..ActorConfig::default()
        };
        let actor = Actor::new(Arc::new(machine), ActorRegistry::new(), config).unwrap();
        let mut inspector = actor.inspect();
        actor.start().unwrap();
        actor.send_and_wait("GO").await.unwrap();

        let mut records = Vec::new();
        while let Ok(record) = inspector.try_recv() {
            records.push((record.kind, record.snapshot.value.to_string()));
        }
        assert_eq!(
            records,
            vec![
                (InspectionKind::Snapshot, "a".to_string()),
                (InspectionKind::Microstep, "b".to_string()),
                (InspectionKind::Microstep, "c".to_string()),
                (InspectionKind::Snapshot, "c".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_restarts_activities() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        actor.start().unwrap();
        let persisted = actor.send_and_wait("TIMER").await.unwrap();
        actor.stop().await;

        let restored =
            Actor::restore(light(), ActorRegistry::new(), ActorConfig::default(), &persisted)
                .unwrap();
        assert!(restored.get_snapshot().matches("yellow"));
        restored.start().unwrap();
        let snapshot = restored.wait_for(|s| s.matches("red")).await.unwrap();
        assert!(snapshot.is_active());
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let actor = Actor::new(light(), ActorRegistry::new(), ActorConfig::default()).unwrap();
        let snapshot = actor.stop().await;
        assert_eq!(snapshot.status, Status::Stopped);
        assert!(matches!(actor.start(), Err(ActorError::Stopped(_))));
        actor.send("TIMER");
        assert_eq!(actor.get_snapshot().status, Status::Stopped);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ActorConfig {
            max_microsteps: 0,
            ..ActorConfig::default()
        };
        assert!(matches!(
            Actor::new(light(), ActorRegistry::new(), config),
            Err(ActorError::Config(_))
        ));
    }

    #[test]
    fn test_input_must_be_object() {
        let result = Actor::with_input(
            light(),
            ActorRegistry::new(),
            ActorConfig::default(),
            json!([1, 2]),
        );
        assert!(matches!(result, Err(ActorError::Core(_))));
    }
}
