// src/events.rs
//
// Room events delivered to clients over the per-session SSE stream.
//
// Each session owns a bounded queue; `session` (the session-assignment
// event) is always the first event a session observes, followed by `users`
// snapshots on every membership or streaming-status change.
//
// ────────────────────────────────────────────────────────────────────────────

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of each session's event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 32;

// ─── Event payloads ─────────────────────────────────────────────────────────

/// One user as seen by clients in a `users` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSnapshot {
    pub id: String,
    pub streaming: bool,
}

/// An event enqueued to a session.
///
/// Serialises to the bare payload; the SSE `event:` field carries the
/// variant name from [`RoomEvent::event_type`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RoomEvent {
    /// Delivered once, first, to the joining session.
    SessionAssigned {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Delivered on membership or streaming-status change.
    UsersUpdated { users: Vec<UserSnapshot> },
}

impl RoomEvent {
    pub fn session_assigned(session_id: uuid::Uuid) -> Self {
        Self::SessionAssigned {
            session_id: session_id.to_string(),
        }
    }

    pub fn users_updated(users: Vec<UserSnapshot>) -> Self {
        Self::UsersUpdated { users }
    }

    /// Stable string used in the SSE `event:` field.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionAssigned { .. } => "session",
            Self::UsersUpdated { .. } => "users",
        }
    }
}

// ─── EventQueue ─────────────────────────────────────────────────────────────

/// Bounded, FIFO event queue owned by a session.
///
/// Sends never block. A full queue means the consumer stopped draining its
/// SSE stream; the queue is closed so the slow consumer observes end-of-
/// stream and reconnects, rather than being silently starved. `close` is
/// idempotent and ends the consumer's receive loop.
pub struct EventQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<RoomEvent>>>,
}

impl EventQueue {
    /// Create a queue and the receiving half handed to the SSE consumer.
    pub fn bounded() -> (Self, mpsc::Receiver<RoomEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        (
            Self {
                tx: std::sync::Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Enqueue an event. Disconnects the consumer when the queue is full.
    pub fn send(&self, event: RoomEvent) {
        let mut slot = self.tx.lock().unwrap();
        let Some(tx) = slot.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("event queue full, disconnecting slow consumer");
                *slot = None;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *slot = None;
            }
        }
    }

    /// Close the queue. Any consumer blocked on receive observes the close.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_event_json() {
        let id = uuid::Uuid::new_v4();
        let event = RoomEvent::session_assigned(id);
        assert_eq!(event.event_type(), "session");

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["sessionId"], id.to_string());
    }

    #[test]
    fn users_event_json() {
        let event = RoomEvent::users_updated(vec![
            UserSnapshot {
                id: "a".into(),
                streaming: true,
            },
            UserSnapshot {
                id: "b".into(),
                streaming: false,
            },
        ]);
        assert_eq!(event.event_type(), "users");

        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(value["users"][0]["id"], "a");
        assert_eq!(value["users"][0]["streaming"], true);
        assert_eq!(value["users"][1]["streaming"], false);
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let (queue, mut rx) = EventQueue::bounded();
        let first = uuid::Uuid::new_v4();
        queue.send(RoomEvent::session_assigned(first));
        queue.send(RoomEvent::users_updated(vec![]));

        match rx.recv().await.unwrap() {
            RoomEvent::SessionAssigned { session_id } => {
                assert_eq!(session_id, first.to_string())
            }
            other => panic!("expected session event, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            RoomEvent::UsersUpdated { .. }
        ));
    }

    #[tokio::test]
    async fn full_queue_disconnects_consumer() {
        let (queue, mut rx) = EventQueue::bounded();
        for _ in 0..EVENT_QUEUE_CAPACITY {
            queue.send(RoomEvent::users_updated(vec![]));
        }
        assert!(!queue.is_closed());

        // One past capacity: the consumer is disconnected, not blocked.
        queue.send(RoomEvent::users_updated(vec![]));
        assert!(queue.is_closed());

        // Buffered events are still drained, then the stream ends.
        for _ in 0..EVENT_QUEUE_CAPACITY {
            assert!(rx.recv().await.is_some());
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_ends_receive() {
        let (queue, mut rx) = EventQueue::bounded();
        queue.close();
        queue.close();
        assert!(rx.recv().await.is_none());

        // Sending after close is a no-op.
        queue.send(RoomEvent::users_updated(vec![]));
    }
}
