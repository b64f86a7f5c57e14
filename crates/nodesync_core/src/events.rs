//! Outbound engine events.
//!
//! The engine publishes these for collaborators outside the core (UI
//! refresh, unread counters, file transfer). Delivery is at-least-once:
//! receivers must reconcile against current store state.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{MutationType, NodeType};

/// Events emitted after a local write or an applied remote change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    NodeCreated {
        node_id: String,
        root_id: String,
        node_type: NodeType,
    },
    NodeUpdated {
        node_id: String,
        root_id: String,
    },
    NodeDeleted {
        node_id: String,
        root_id: String,
    },
    ReactionCreated {
        node_id: String,
        collaborator_id: String,
        reaction: String,
    },
    ReactionDeleted {
        node_id: String,
        collaborator_id: String,
        reaction: String,
    },
    DocumentUpdated {
        document_id: String,
        root_id: String,
    },
    InteractionUpdated {
        node_id: String,
        collaborator_id: String,
    },
    /// A mutation was written to the outbox.
    MutationQueued {
        mutation_id: String,
        mutation_type: MutationType,
    },
    /// A mutation was given up on and its local effect undone.
    MutationReverted {
        mutation_id: String,
        mutation_type: MutationType,
        node_id: String,
        message: String,
    },
    /// The outbox was drained or an incoming batch was applied.
    SyncCompleted {
        pushed: usize,
        applied: usize,
    },
}

/// Fan-out for [`EngineEvent`]s. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        log::trace!("event: {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::SyncCompleted {
            pushed: 0,
            applied: 0,
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::NodeDeleted {
            node_id: "n1".into(),
            root_id: "r1".into(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::NodeDeleted {
                node_id: "n1".into(),
                root_id: "r1".into()
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(EngineEvent::MutationQueued {
            mutation_id: "m".into(),
            mutation_type: MutationType::CreateNode,
        })
        .unwrap();
        assert_eq!(json["type"], "mutation_queued");
        assert_eq!(json["mutationType"], "create_node");
    }
}
