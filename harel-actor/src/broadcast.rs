//! Snapshot broadcasting for actor subscribers and inspectors.

use dashmap::DashMap;
use harel_core::Snapshot;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Callback invoked with every published snapshot.
pub type Observer = Arc<dyn Fn(&Arc<Snapshot>) + Send + Sync>;

/// What an inspection record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionKind {
    /// Intermediate state after a single microstep.
    Microstep,
    /// Settled state after a macrostep.
    Snapshot,
}

/// Inspection record sent to [`SnapshotBroadcaster::inspect`] receivers.
#[derive(Debug, Clone)]
pub struct InspectionEvent {
    pub actor_id: String,
    /// Type of the event being processed.
    pub event: String,
    pub kind: InspectionKind,
    pub snapshot: Arc<Snapshot>,
}

/// Fans snapshots out to observers, channel subscribers and inspectors.
pub struct SnapshotBroadcaster {
    observers: DashMap<String, Observer>,

    /// Channel for `subscribe_channel` receivers.
    sender: broadcast::Sender<Arc<Snapshot>>,

    inspector: broadcast::Sender<InspectionEvent>,
}

impl SnapshotBroadcaster {
    /// Creates a new SnapshotBroadcaster with the specified channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity);
        let (inspector, _) = broadcast::channel(channel_capacity);
        Self {
            observers: DashMap::new(),
            sender,
            inspector,
        }
    }

    /// Registers an observer. Returns the subscription id.
    pub fn subscribe(&self, observer: Observer) -> String {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        self.observers.insert(subscription_id.clone(), observer);
        subscription_id
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.observers.remove(subscription_id).is_some()
    }

    pub fn subscribe_channel(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }

    pub fn inspect(&self) -> broadcast::Receiver<InspectionEvent> {
        self.inspector.subscribe()
    }

    /// Delivers a settled snapshot to every subscriber.
    pub fn publish(&self, actor_id: &str, event: &str, snapshot: Arc<Snapshot>) {
        // Observers may unsubscribe from inside the callback, so the map
        // must not be locked while they run.
        let observers: Vec<Observer> = self.observers.iter().map(|o| o.value().clone()).collect();
        for observer in observers {
            observer(&snapshot);
        }

        // Ignore send errors (no receivers)
        let _ = self.sender.send(snapshot.clone());
        self.notify_inspectors(actor_id, event, InspectionKind::Snapshot, snapshot);
    }

    pub fn notify_inspectors(
        &self,
        actor_id: &str,
        event: &str,
        kind: InspectionKind,
        snapshot: Arc<Snapshot>,
    ) {
        if self.inspector.receiver_count() == 0 {
            return;
        }
        let _ = self.inspector.send(InspectionEvent {
            actor_id: actor_id.to_string(),
            event: event.to_string(),
            kind,
            snapshot,
        });
    }

    pub fn has_inspectors(&self) -> bool {
        self.inspector.receiver_count() > 0
    }

    /// Returns the number of registered observers.
    pub fn subscription_count(&self) -> usize {
        self.observers.len()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle returned by `Actor::subscribe`.
///
/// Dropping the handle keeps the observer registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    broadcaster: Weak<SnapshotBroadcaster>,
}

impl Subscription {
    pub(crate) fn new(id: String, broadcaster: &Arc<SnapshotBroadcaster>) -> Self {
        Self {
            id,
            broadcaster: Arc::downgrade(broadcaster),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Removes the observer. Safe to call more than once; later calls
    /// return false.
    pub fn unsubscribe(&self) -> bool {
        self.broadcaster
            .upgrade()
            .map(|b| b.unsubscribe(&self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for SnapshotBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBroadcaster")
            .field("observers", &self.observers.len())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
