//! Sync notifications for external observers.

use docsync_protocol::{Conflict, EntityKind, SyncStatus};
use tokio::sync::broadcast;
use tracing::trace;

/// Notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A push or pull started.
    SyncStarted {
        /// Local entity id.
        entity_id: String,
    },
    /// A push or pull completed.
    SyncCompleted {
        /// Local entity id.
        entity_id: String,
        /// Remote id after the sync.
        remote_id: String,
        /// Remote version after the sync.
        version: u64,
    },
    /// A push or pull failed.
    SyncFailed {
        /// Local entity id.
        entity_id: String,
        /// Error message.
        error: String,
        /// Whether the queue will retry.
        retryable: bool,
    },
    /// Local and remote versions diverged.
    ConflictDetected(Conflict),
    /// An entity's sync status changed.
    StatusChanged {
        /// Entity kind.
        kind: EntityKind,
        /// Local entity id.
        entity_id: String,
        /// New status.
        status: SyncStatus,
    },
}

/// Broadcast bus for [`SyncEvent`]s.
///
/// Emitting never blocks and never fails; events sent while nobody listens
/// are dropped, and slow receivers observe a lag error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emits an event.
    pub fn emit(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            trace!("sync event dropped, no subscribers");
        }
    }

    /// Emits a status change.
    pub fn status(&self, kind: EntityKind, entity_id: &str, status: SyncStatus) {
        self.emit(SyncEvent::StatusChanged {
            kind,
            entity_id: entity_id.to_string(),
            status,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::SyncStarted {
            entity_id: "d".into(),
        });
        bus.status(EntityKind::Document, "d", SyncStatus::Synced);

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SyncStarted {
                entity_id: "d".into()
            }
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncEvent::StatusChanged {
                status: SyncStatus::Synced,
                ..
            }
        ));
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::ConflictDetected(Conflict::content("d", 1, 2)));
    }
}
