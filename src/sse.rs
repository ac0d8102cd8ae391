// src/sse.rs
//
// Server-Sent Events endpoints.
//
// ─ Usage ────────────────────────────────────────────────────────────────────
//
//   GET /api/room/{room_id}?authToken=<token>
//
//   Joins the room and stays open, streaming room events as they occur:
//
//     event: session
//     data:  {"sessionId":"<uuid>"}
//
//     event: users
//     data:  {"users":[{"id":"<uuid>","streaming":false}]}
//
//   The session lives exactly as long as this request: when the client
//   disconnects (or its event queue overflows), the session is removed from
//   the room and every structure that references it.
//
//   GET /api/sse/{viewer_session_id}
//
//   Emits a single `layers` event describing the publisher's known
//   simulcast layers, then ends.
//
// ────────────────────────────────────────────────────────────────────────────

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use tracing::warn;

use crate::error::ApiError;
use crate::room::{Room, Rooms, Session, SessionId};
use crate::AppState;

// ─── Session lifetime guard ─────────────────────────────────────────────────

/// Ties a session's lifetime to its event stream: dropping the stream (the
/// client went away) removes the session from the room.
struct SessionGuard {
    rooms: Rooms,
    room: Arc<Room>,
    session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let rooms = self.rooms.clone();
        let room = Arc::clone(&self.room);
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            rooms.remove_session(&room, &session).await;
        });
    }
}

// ─── Room event stream ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    #[serde(rename = "authToken")]
    pub auth_token: Option<String>,
}

/// `GET /api/room/{room_id}` — join the room and stream its events.
pub async fn room_events_handler(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let auth_token = query.auth_token.ok_or(ApiError::InvalidAuthToken)?;

    let (room, session, mut rx) = state.rooms.join(&room_id, &auth_token).await?;
    let guard = SessionGuard {
        rooms: state.rooms.clone(),
        room,
        session,
    };

    let stream = async_stream::stream! {
        // Moved into the stream so client disconnect tears the session down.
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("could not serialize room event: {e}");
                    continue;
                }
            };
            yield Ok(SseEvent::default().event(event.event_type()).data(json));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

// ─── Layer event stream ─────────────────────────────────────────────────────

/// `GET /api/sse/{viewer_session_id}` — single `layers` event for the
/// publisher the viewer is attached to.
pub async fn layer_events_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_session_id): Path<SessionId>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let layers = crate::whep::whep_layers(&state, viewer_session_id).await?;
    let json = serde_json::to_string(&layers)
        .map_err(|e| ApiError::Internal(format!("serialize layers: {e}")))?;

    let stream = futures::stream::once(async move {
        Ok::<_, Infallible>(SseEvent::default().event("layers").data(json))
    });
    Ok(Sse::new(stream))
}

// ─── Status endpoint ────────────────────────────────────────────────────────

/// `GET /api/status` — room and session counts.
pub async fn status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (rooms, sessions) = state.rooms.stats().await;
    Json(serde_json::json!({
        "rooms": rooms,
        "sessions": sessions,
    }))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropping_the_guard_removes_the_session() {
        let rooms = Rooms::new();
        let (room, session, _rx) = rooms.join("r", "tok").await.unwrap();

        drop(SessionGuard {
            rooms: rooms.clone(),
            room,
            session: Arc::clone(&session),
        });

        // Removal runs on a spawned task; give it a moment.
        for _ in 0..50 {
            if !rooms.contains("r").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!rooms.contains("r").await);
        assert!(session.events.is_closed());
    }
}
