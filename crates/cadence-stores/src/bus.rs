//! ChangeBus - realtime state-change fan-out.
//!
//! The bus complements the change journal:
//! - The journal feeds the engine's own effects in write order.
//! - The bus pushes the same changes to live host subscribers.

use tokio::sync::broadcast;

use cadence_core::store::StateChange;

/// In-process fan-out of state changes based on tokio broadcast channels.
pub struct ChangeBus {
    tx: broadcast::Sender<StateChange>,
    capacity: usize,
}

impl ChangeBus {
    /// Create a new bus with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Return the configured channel capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish a change to all active subscribers.
    /// "No receiver" is a non-error; the journal remains source-of-truth.
    pub fn publish(&self, change: StateChange) {
        let _ = self.tx.send(change);
    }

    /// Subscribe to realtime changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        // Default capacity for local realtime consumers.
        Self::new(1024)
    }
}
