//! Store event hub (spec §4.4: `UnversionedObjectStored`, `VersionedObjectStored`)
//!
//! A small typed pub-sub layer over [`tokio::sync::broadcast`], the same
//! primitive the teacher's server loop uses for its shutdown signal. Listeners
//! subscribe and get their own receiver; dropping it unsubscribes. Events are
//! fire-and-forget — a listener that isn't polling when the channel fills
//! simply lags and sees [`tokio::sync::broadcast::error::RecvError::Lagged`].

use crate::hash::{IdHash, ObjectHash};
use tokio::sync::broadcast;

/// Events emitted by the object store (spec §4.4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    UnversionedObjectStored(ObjectHash),
    VersionedObjectStored { id_hash: IdHash, hash: ObjectHash, timestamp: u64 },
}

/// Broadcast hub for [`StoreEvent`]s. Cloning shares the same underlying
/// channel, so every clone of a `Store` publishes to and can subscribe from
/// the same stream.
#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventHub {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Errors only when there are zero subscribers, which is
    /// not a failure worth surfacing to the writer that triggered it.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
