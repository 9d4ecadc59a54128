// File: portal-sync/src/events.rs
// Purpose: Typed event stream consumed by presentation layers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::models::{Operation, Priority};
use crate::offline::ConnectivityStatus;

/// Everything the core reports to the outside world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    ItemEnqueued {
        item_id: Uuid,
        entity_type: String,
        entity_id: String,
        operation: Operation,
        priority: Priority,
    },
    ItemApplied {
        item_id: Uuid,
        entity_type: String,
        entity_id: String,
        version: Option<i64>,
    },
    ItemRetryScheduled {
        item_id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    ItemFailed {
        item_id: Uuid,
        retry_count: u32,
        error: String,
    },
    ItemDiscarded {
        item_id: Uuid,
    },
    ConflictDetected {
        item_id: Uuid,
        entity_type: String,
        entity_id: String,
        fields: Vec<String>,
    },
    ConflictResolved {
        item_id: Uuid,
        entity_type: String,
        entity_id: String,
        resubmitted: bool,
    },
    ActionRecorded {
        action_id: Uuid,
        description: String,
        entity_ids: Vec<String>,
        undo_timeout_ms: u64,
    },
    ActionUndone {
        action_id: Uuid,
    },
    ActionEvicted {
        action_id: Uuid,
    },
    ConnectivityChanged {
        status: ConnectivityStatus,
    },
    SyncStarted,
    SyncFinished {
        applied: usize,
        conflicts: usize,
        failed: usize,
        halted_offline: bool,
    },
}

/// Broadcast hub shared by every component
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event (ignored when nobody is listening)
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`; lagged receivers yield an error item
    pub fn stream(&self) -> BroadcastStream<SyncEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_emit_reaches_stream() {
        let bus = EventBus::new();
        let mut stream = bus.stream();

        bus.emit(SyncEvent::SyncStarted);
        bus.emit(SyncEvent::ActionUndone {
            action_id: Uuid::nil(),
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), SyncEvent::SyncStarted);
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            SyncEvent::ActionUndone {
                action_id: Uuid::nil()
            }
        );
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::SyncStarted);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(SyncEvent::ItemDiscarded {
            item_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "item_discarded");
    }
}
