//! Event types for the ingestion event system
//!
//! Provides the shared event definitions and the EventBus used to pass
//! "identity became available" notifications from the upserters to the
//! relationship linker, and outcome notifications to any observer.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kinds of entity registered in the identity table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Plate,
    Sample,
    Study,
}

impl EntityKind {
    /// Column value used in `lims_identities.entity_kind` and `deferred_links.entity_kind`
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Plate => "plate",
            EntityKind::Sample => "sample",
            EntityKind::Study => "study",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plate" => Some(EntityKind::Plate),
            "sample" => Some(EntityKind::Sample),
            "study" => Some(EntityKind::Study),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A sample or study committed under this identity
    ///
    /// Triggers:
    /// - Link worker: fulfil deferred-link obligations waiting on it
    IdentityAvailable {
        kind: EntityKind,
        /// LIMS source tag (id_lims)
        source: String,
        external_id: String,
        guid: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A plate message committed
    PlateReconciled {
        guid: Uuid,
        source: String,
        external_id: String,
        /// "created", "updated" or "stale"
        outcome: String,
        /// Wells created or updated by the message
        wells_written: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Deferred references attached after their target arrived
    WellsLinked {
        kind: EntityKind,
        source: String,
        external_id: String,
        well_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A message was rejected and nothing from it was persisted
    MessageRejected {
        source: String,
        external_id: Option<String>,
        /// Stable reason code, e.g. "VALIDATION_ERROR"
        reason: String,
        detail: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

/// Broadcast bus for [`IngestEvent`]s
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Subscribers that fall more than `capacity` events behind observe
    /// `RecvError::Lagged` and lose the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }
}
