//! Invocation logic and the registry that resolves `invoke.src`.

use crate::actor::Message;
use futures::future::BoxFuture;
use futures::FutureExt;
use harel_core::{Event, Machine};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Resolves with the output (`Ok`) or error (`Err`) of a one-shot task.
pub type TaskFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

/// Long-running logic that talks to its parent through a [`CallbackHandle`].
pub type CallbackFn =
    Arc<dyn Fn(Value, CallbackHandle) -> BoxFuture<'static, Result<Value, Value>> + Send + Sync>;

/// Something an invocation can run.
#[derive(Clone)]
pub enum ActorLogic {
    /// Async function; completion becomes `done.invoke.<id>` or
    /// `error.invoke.<id>`.
    Task(TaskFn),
    /// Async function with a channel back to the parent and an inbox.
    Callback(CallbackFn),
    /// Nested statechart run as a child actor.
    Machine(Arc<Machine>),
}

impl ActorLogic {
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        ActorLogic::Task(Arc::new(move |input| f(input).boxed()))
    }

    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn(Value, CallbackHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        ActorLogic::Callback(Arc::new(move |input, handle| f(input, handle).boxed()))
    }

    pub fn machine(machine: impl Into<Arc<Machine>>) -> Self {
        ActorLogic::Machine(machine.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ActorLogic::Task(_) => "task",
            ActorLogic::Callback(_) => "callback",
            ActorLogic::Machine(_) => "machine",
        }
    }
}

impl fmt::Debug for ActorLogic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorLogic::Machine(machine) => write!(f, "Machine({})", machine.id()),
            other => f.write_str(other.kind()),
        }
    }
}

/// Named logic available to `invoke.src`.
#[derive(Clone, Default)]
pub struct ActorRegistry {
    logic: HashMap<String, ActorLogic>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers logic under `name`, replacing any previous entry.
    pub fn register(mut self, name: impl Into<String>, logic: ActorLogic) -> Self {
        self.insert(name, logic);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, logic: ActorLogic) {
        self.logic.insert(name.into(), logic);
    }

    pub fn get(&self, name: &str) -> Option<&ActorLogic> {
        self.logic.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.logic.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.logic.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.logic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logic.is_empty()
    }
}

impl fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.logic.iter()).finish()
    }
}

/// Connection between a callback invocation and the actor that owns it.
pub struct CallbackHandle {
    id: String,
    generation: u64,
    parent: mpsc::UnboundedSender<Message>,
    inbox: mpsc::UnboundedReceiver<Event>,
}

impl CallbackHandle {
    pub(crate) fn new(
        id: String,
        generation: u64,
        parent: mpsc::UnboundedSender<Message>,
        inbox: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            id,
            generation,
            parent,
            inbox,
        }
    }

    /// Invocation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sends an event to the owning actor. Returns false once the actor
    /// has stopped. Events sent after the invocation was cancelled are
    /// discarded by the owner.
    pub fn send_parent(&self, event: impl Into<Event>) -> bool {
        self.parent
            .send(Message::Child {
                id: self.id.clone(),
                generation: self.generation,
                event: event.into(),
                completes: false,
            })
            .is_ok()
    }

    /// Receives the next event addressed to this invocation.
    ///
    /// Returns `None` when the invocation has been cancelled.
    pub async fn recv(&mut self) -> Option<Event> {
        self.inbox.recv().await
    }

    /// Receives an event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.inbox.try_recv().ok()
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}
