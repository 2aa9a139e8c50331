//! Named guards, actions, and delay resolvers referenced by a definition.

use crate::action::Effect;
use crate::error::BoxError;
use crate::event::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type GuardFn = Arc<dyn Fn(&Value, &Event) -> Result<bool, BoxError> + Send + Sync>;
pub type ActionFn = Arc<dyn Fn(&Value, &Event) -> Result<Vec<Effect>, BoxError> + Send + Sync>;
pub type DelayFn = Arc<dyn Fn(&Value, &Event) -> Duration + Send + Sync>;

/// Build-time table of user functions, owned by the compiled machine.
#[derive(Clone, Default)]
pub struct Implementations {
    guards: HashMap<String, GuardFn>,
    actions: HashMap<String, ActionFn>,
    delays: HashMap<String, DelayFn>,
}

impl Implementations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named guard.
    pub fn guard<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    /// Registers a named action.
    pub fn action<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Result<Vec<Effect>, BoxError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(f));
        self
    }

    /// Registers a named delay resolver.
    pub fn delay<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value, &Event) -> Duration + Send + Sync + 'static,
    {
        self.delays.insert(name.into(), Arc::new(f));
        self
    }

    pub fn has_guard(&self, name: &str) -> bool {
        self.guards.contains_key(name)
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn has_delay(&self, name: &str) -> bool {
        self.delays.contains_key(name)
    }

    pub(crate) fn call_guard(&self, name: &str, ctx: &Value, event: &Event) -> Result<bool, BoxError> {
        match self.guards.get(name) {
            Some(f) => f(ctx, event),
            None => Err(format!("guard '{}' is not implemented", name).into()),
        }
    }

    pub(crate) fn call_action(
        &self,
        name: &str,
        ctx: &Value,
        event: &Event,
    ) -> Result<Vec<Effect>, BoxError> {
        match self.actions.get(name) {
            Some(f) => f(ctx, event),
            None => Err(format!("action '{}' is not implemented", name).into()),
        }
    }

    pub(crate) fn call_delay(&self, name: &str, ctx: &Value, event: &Event) -> Option<Duration> {
        self.delays.get(name).map(|f| f(ctx, event))
    }
}

impl fmt::Debug for Implementations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut guards: Vec<_> = self.guards.keys().collect();
        let mut actions: Vec<_> = self.actions.keys().collect();
        let mut delays: Vec<_> = self.delays.keys().collect();
        guards.sort();
        actions.sort();
        delays.sort();
        f.debug_struct("Implementations")
            .field("guards", &guards)
            .field("actions", &actions)
            .field("delays", &delays)
            .finish()
    }
}
