//! Advisory change notifications.
//!
//! Components publish a [`ChangeEvent`] after mutating a local table so other
//! views (another window, a dashboard widget) can refresh. Delivery is best
//! effort and never required for correctness; publishing with no subscribers
//! is a no-op.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::EntityKind;

/// A local table changed for a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub store_id: String,
    pub entity: EntityKind,
}

/// Fire-and-forget pub/sub hub for change events.
pub struct ChangeHub {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, store_id: &str, entity: EntityKind) {
        let event = ChangeEvent {
            store_id: store_id.to_string(),
            entity,
        };
        trace!(store_id, entity = entity.as_str(), "change event");
        // No subscribers is fine; the signal is advisory.
        let _ = self.tx.send(event);
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new(64)
    }
}
