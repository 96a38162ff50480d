//! User-facing notification fan-out.
//!
//! Dispatch turns specific change events (a task reassigned, a comment
//! added, a phase moving forward) into `Notification` values and broadcasts
//! them to whoever is listening. Broadcast once, never retained: the
//! consuming layer decides what to keep.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const EMITTER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskAssignment,
    PhaseProgression,
    CommentAdded,
    DependencyChanged,
    PresenceUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub actor_id: Option<String>,
    pub payload: serde_json::Value,
    /// RFC 3339; attached by the emitter at send time when absent.
    pub timestamp: Option<String>,
}

impl Notification {
    pub fn new(
        kind: NotificationKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor_id: None,
            payload: serde_json::Value::Null,
            timestamp: None,
        }
    }

    pub fn with_actor(mut self, actor_id: Option<String>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Synchronous fan-out to all local observers. Side effect only: sending
/// never blocks and never fails dispatch.
pub struct NotificationEmitter {
    tx: broadcast::Sender<Notification>,
}

impl NotificationEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EMITTER_CAPACITY);
        Self { tx }
    }

    pub fn send(&self, mut notification: Notification) {
        if notification.timestamp.is_none() {
            notification.timestamp = Some(Utc::now().to_rfc3339());
        }
        if let Err(e) = self.tx.send(notification) {
            tracing::debug!("notification dropped (no observers): {e}");
        }
    }

    /// Get a new receiver for this emitter.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for NotificationEmitter {
    fn default() -> Self {
        Self::new()
    }
}
