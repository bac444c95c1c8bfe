//! Application event system for the status surface.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that status queries can show what the
//! engine has been doing lately.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::OperationId;
use crate::model::{ChangeSource, OperationKind};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Operations ----------------------------------------------------------
    OperationApplied {
        op_id: OperationId,
        path: String,
        kind: OperationKind,
        changed: bool,
    },
    OperationRetrying {
        op_id: OperationId,
        path: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    OperationDeadLettered {
        op_id: OperationId,
        path: String,
        error_kind: String,
        error: String,
    },

    // -- Sources -------------------------------------------------------------
    ScanCompleted {
        prefix: String,
        observed: u64,
        operations: u64,
    },
    RescanRequested {
        prefix: String,
        reason: String,
    },
    PollCompleted {
        changes: u64,
    },
    AdapterPaused {
        adapter: String,
    },
    AdapterResumed {
        adapter: String,
    },

    // -- Notifications -------------------------------------------------------
    SectionsRefreshed {
        sections: Vec<String>,
        failed: Vec<String>,
    },
}

impl EventPayload {
    /// Convenience for the source of a completed listing.
    pub fn scan_completed(source: ChangeSource, prefix: &str, observed: u64, operations: u64) -> Self {
        let prefix = if source == ChangeSource::Remote {
            format!("remote:{prefix}")
        } else {
            prefix.to_string()
        };
        EventPayload::ScanCompleted {
            prefix,
            observed,
            operations,
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` controls the broadcast channel buffer size, not the ring
    /// buffer, which is always [`MAX_RECENT_EVENTS`].
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and store it in the
    /// ring buffer.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
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

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let op_id = OperationId::new();
        bus.broadcast(EventPayload::OperationApplied {
            op_id,
            path: "Movies/A.mkv".into(),
            kind: OperationKind::CreateLink,
            changed: true,
        });

        let event = rx.try_recv().unwrap();
        match &event.payload {
            EventPayload::OperationApplied { op_id: got, .. } => assert_eq!(*got, op_id),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn recent_events_capped_and_newest_first() {
        let bus = EventBus::new(256);
        for changes in 0..150 {
            bus.broadcast(EventPayload::PollCompleted { changes });
        }

        let recent = bus.recent_events(200);
        assert_eq!(recent.len(), MAX_RECENT_EVENTS);
        match recent[0].payload {
            EventPayload::PollCompleted { changes } => assert_eq!(changes, 149),
            ref other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn payload_serializes_with_type_tag() {
        let json = serde_json::to_value(EventPayload::scan_completed(
            ChangeSource::Remote,
            "",
            3,
            1,
        ))
        .unwrap();
        assert_eq!(json["type"], "scan_completed");
        assert_eq!(json["prefix"], "remote:");
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::AdapterPaused {
            adapter: "local".into(),
        });
        assert_eq!(bus.recent_events(10).len(), 1);
    }
}
