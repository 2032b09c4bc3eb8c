//! Process-wide event bus
//!
//! Every successful property persistence emits a [`EngineEvent::PropertyUpdated`]
//! keyed by `item.{model}.{seed_local_id}.property.update`, so the owning item
//! reflects the latest value without polling. Collection refreshes announce
//! themselves the same way for downstream consumers.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Topic string for property updates of one item
pub fn property_update_topic(model: &str, seed_local_id: &str) -> String {
    format!("item.{}.{}.property.update", model, seed_local_id)
}

/// Events delivered on the process-wide bus
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A property actor persisted a new value
    PropertyUpdated {
        topic: String,
        model: String,
        seed_local_id: String,
        property: String,
        value: Value,
    },

    /// A collection actor finished a refresh cycle
    CollectionRefreshed { model: String },
}

/// Broadcast bus shared by all actors in the process
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Lagging or absent receivers are not an error.
    pub fn emit(&self, event: EngineEvent) {
        trace!(?event, "bus emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
