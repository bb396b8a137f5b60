//! Broadcast channel for synchronization events.
//!
//! Subscribers (UI layers, metrics collectors) observe queue activity
//! without polling. Emission never blocks and never fails: events to a
//! bus with no subscribers are simply dropped.

use crate::{CollectionName, OpToken, RecordId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Events emitted as operations move through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    /// A new operation was durably enqueued.
    OperationEnqueued {
        token: OpToken,
        collection: CollectionName,
    },
    /// An operation was applied at the remote store.
    OperationSynced {
        token: OpToken,
        collection: CollectionName,
    },
    /// An operation reached the retry ceiling and was flagged as failed.
    OperationFailed {
        token: OpToken,
        collection: CollectionName,
    },
    /// The number of pending operations changed.
    QueueSizeChanged { pending: usize },
    /// A temporary identifier was rewritten to its authoritative one.
    IdentifierReconciled {
        collection: CollectionName,
        temporary_id: RecordId,
        authoritative_id: RecordId,
    },
}

impl SyncEvent {
    /// Human-readable variant name, for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::OperationEnqueued { .. } => "OperationEnqueued",
            SyncEvent::OperationSynced { .. } => "OperationSynced",
            SyncEvent::OperationFailed { .. } => "OperationFailed",
            SyncEvent::QueueSizeChanged { .. } => "QueueSizeChanged",
            SyncEvent::IdentifierReconciled { .. } => "IdentifierReconciled",
        }
    }
}

/// Broadcast bus carrying [`SyncEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, event: SyncEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event = event_type, subscribers = count, "event emitted");
                count
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
