// src/room.rs
//
// Rooms, users and sessions: the membership graph the media pipelines hang
// off of.
//
// A session is one live client connection; sessions joining a room with the
// same auth token share one user, so a user can be present from several
// tabs while publishing at most one stream. Lock order is strict:
// registry → room → stream, never reversed. Empty-room removal is done by
// the registry, which already holds its own lock before touching the room.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::info;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::ApiError;
use crate::events::{EventQueue, RoomEvent, UserSnapshot};
use crate::stream::{PublisherStream, ViewerSession};

pub type SessionId = Uuid;
pub type UserId = Uuid;

const MAX_AUTH_TOKEN_LEN: usize = 1024;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// One identity inside a room, shared by every session that joined with the
/// same auth token.
pub struct User {
    pub id: UserId,
    /// Opaque token used as the WHIP stream key and to match sessions to
    /// this user within the room.
    pub auth_token: String,

    /// Single-occupancy publisher slot; `None` when not streaming.
    stream: std::sync::Mutex<Option<Arc<PublisherStream>>>,
}

impl User {
    fn new(auth_token: &str) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            auth_token: auth_token.to_owned(),
            stream: std::sync::Mutex::new(None),
        })
    }

    /// Occupy the stream slot if and only if it is empty.
    fn try_set_stream(&self, stream: &Arc<PublisherStream>) -> bool {
        let mut slot = self.stream.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(stream));
        true
    }

    /// Empty the stream slot, returning the previous occupant. At most one
    /// of any number of concurrent callers gets it, which makes stream
    /// teardown run exactly once.
    fn take_stream(&self) -> Option<Arc<PublisherStream>> {
        self.stream.lock().unwrap().take()
    }

    pub fn stream(&self) -> Option<Arc<PublisherStream>> {
        self.stream.lock().unwrap().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.lock().unwrap().is_some()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One live client connection to a room.
pub struct Session {
    pub id: SessionId,
    pub user: Arc<User>,
    pub events: EventQueue,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

pub struct Room {
    id: String,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl Room {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Find the room member with the given user id.
    pub async fn user_by_id(&self, user_id: UserId) -> Option<Arc<User>> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .map(|s| &s.user)
            .find(|u| u.id == user_id)
            .cloned()
    }

    async fn broadcast_users(&self) {
        let sessions = self.sessions.read().await;
        broadcast_users(&sessions);
    }

    /// Construct a publisher stream over `peer_conn` and occupy the user's
    /// stream slot. Fails with `AlreadyStreaming` when the slot is taken; the
    /// caller must then discard the peer connection.
    pub async fn start_stream(
        &self,
        user: &Arc<User>,
        peer_conn: Arc<RTCPeerConnection>,
    ) -> Result<Arc<PublisherStream>, ApiError> {
        let stream = PublisherStream::new(peer_conn);
        let sessions = self.sessions.write().await;
        if !user.try_set_stream(&stream) {
            return Err(ApiError::AlreadyStreaming);
        }
        info!(user = %user.id, room = %self.id, "user started streaming");
        broadcast_users(&sessions);
        Ok(stream)
    }

    /// Tear down the user's publisher stream, closing the ingress peer
    /// connection and every viewer. Safe to call concurrently and
    /// repeatedly; only the caller that wins the slot swap runs the
    /// teardown and the broadcast.
    pub async fn stop_stream(&self, user: &Arc<User>) {
        let Some(stream) = user.take_stream() else {
            return;
        };
        info!(user = %user.id, room = %self.id, "user stopped streaming");
        stream.stop().await;
        self.broadcast_users().await;
    }

    /// Remove a session from the room, cascading across every structure
    /// that references it. Returns `true` when the room is now empty (the
    /// registry then drops it).
    async fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        session.events.close();
        if sessions.remove(&session.id).is_none() {
            return sessions.is_empty();
        }
        info!(session = %session.id, room = %self.id, "session left room");

        // Close this session's viewer attachments on every publisher still
        // in the room.
        for user in distinct_users(&sessions) {
            if let Some(stream) = user.stream() {
                stream.remove_viewer(session.id).await;
            }
        }

        let user_gone = !sessions.values().any(|s| s.user.id == session.user.id);
        if user_gone {
            info!(user = %session.user.id, room = %self.id, "removing user from room");
            if let Some(stream) = session.user.take_stream() {
                stream.stop().await;
            }
            if !sessions.is_empty() {
                broadcast_users(&sessions);
            }
        }

        sessions.is_empty()
    }

    /// Drop every session, stopping any streams and closing event queues.
    async fn close(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            if let Some(stream) = session.user.take_stream() {
                stream.stop().await;
            }
            session.events.close();
        }
    }
}

fn distinct_users(sessions: &HashMap<SessionId, Arc<Session>>) -> Vec<Arc<User>> {
    let mut seen = HashSet::new();
    sessions
        .values()
        .filter(|s| seen.insert(s.user.id))
        .map(|s| Arc::clone(&s.user))
        .collect()
}

fn users_snapshot(sessions: &HashMap<SessionId, Arc<Session>>) -> Vec<UserSnapshot> {
    distinct_users(sessions)
        .into_iter()
        .map(|user| UserSnapshot {
            id: user.id.to_string(),
            streaming: user.is_streaming(),
        })
        .collect()
}

/// Enqueue an event to every session in the (already locked) map.
fn broadcast(sessions: &HashMap<SessionId, Arc<Session>>, event: RoomEvent) {
    for session in sessions.values() {
        session.events.send(event.clone());
    }
}

fn broadcast_users(sessions: &HashMap<SessionId, Arc<Session>>) {
    broadcast(sessions, RoomEvent::users_updated(users_snapshot(sessions)));
}

// ---------------------------------------------------------------------------
// Rooms — the process-wide registry
// ---------------------------------------------------------------------------

/// Registry of all live rooms. Cheap to clone; the map lives behind one
/// coarse lock guarding room creation and destruction.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<Mutex<HashMap<String, Arc<Room>>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join `room_id` with `auth_token`, creating the room on first join and
    /// sharing the user with any session that presented the same token.
    ///
    /// The returned receiver is the session's event stream: the
    /// session-assignment event is already queued first, followed by a
    /// `users` snapshot. Other members are only notified when the join
    /// created a new user — an extra tab changes nobody else's view.
    pub async fn join(
        &self,
        room_id: &str,
        auth_token: &str,
    ) -> Result<(Arc<Room>, Arc<Session>, mpsc::Receiver<RoomEvent>), ApiError> {
        if auth_token.is_empty() || auth_token.len() >= MAX_AUTH_TOKEN_LEN {
            return Err(ApiError::InvalidAuthToken);
        }

        let mut rooms = self.inner.lock().await;
        let room = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Room::new(room_id))
            .clone();

        let mut sessions = room.sessions.write().await;
        let (user, created_user) = match sessions
            .values()
            .find(|s| s.user.auth_token == auth_token)
        {
            Some(session) => (Arc::clone(&session.user), false),
            None => (User::new(auth_token), true),
        };
        if created_user {
            info!(user = %user.id, room = room_id, "new user joined room");
        }

        let (events, rx) = EventQueue::bounded();
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            user,
            events,
        });
        sessions.insert(session.id, Arc::clone(&session));

        session.events.send(RoomEvent::session_assigned(session.id));
        if created_user {
            broadcast_users(&sessions);
        } else {
            session
                .events
                .send(RoomEvent::users_updated(users_snapshot(&sessions)));
        }
        drop(sessions);

        Ok((room, session, rx))
    }

    /// Locate a session by id across all rooms.
    pub async fn find_session(
        &self,
        session_id: SessionId,
    ) -> Option<(Arc<Room>, Arc<Session>)> {
        let rooms = self.inner.lock().await;
        for room in rooms.values() {
            let sessions = room.sessions.read().await;
            if let Some(session) = sessions.get(&session_id) {
                return Some((Arc::clone(room), Arc::clone(session)));
            }
        }
        None
    }

    /// Locate the room and user an auth token is currently joined as.
    pub async fn find_user_by_auth(
        &self,
        auth_token: &str,
    ) -> Option<(Arc<Room>, Arc<User>)> {
        let rooms = self.inner.lock().await;
        for room in rooms.values() {
            let sessions = room.sessions.read().await;
            if let Some(session) = sessions
                .values()
                .find(|s| s.user.auth_token == auth_token)
            {
                return Some((Arc::clone(room), Arc::clone(&session.user)));
            }
        }
        None
    }

    /// Locate the publisher stream a viewer session is attached to, with
    /// the viewer's egress state.
    pub async fn find_viewer(
        &self,
        viewer_session_id: SessionId,
    ) -> Option<(Arc<PublisherStream>, Arc<ViewerSession>)> {
        let rooms = self.inner.lock().await;
        for room in rooms.values() {
            let sessions = room.sessions.read().await;
            for user in distinct_users(&sessions) {
                if let Some(stream) = user.stream() {
                    if let Some(viewer) = stream.viewer(viewer_session_id).await {
                        return Some((stream, viewer));
                    }
                }
            }
        }
        None
    }

    /// Remove a session, dropping its room from the registry when it was
    /// the last one. Idempotent: removing an already-removed session only
    /// re-checks room emptiness.
    pub async fn remove_session(&self, room: &Arc<Room>, session: &Arc<Session>) {
        let mut rooms = self.inner.lock().await;
        let empty = room.remove_session(session).await;
        if empty {
            // Only drop the exact room instance we worked on; a new room
            // with the same id may have been created concurrently.
            if rooms.get(&room.id).is_some_and(|r| Arc::ptr_eq(r, room)) {
                info!(room = %room.id, "closing room, all sessions have left");
                rooms.remove(&room.id);
            }
        }
    }

    /// Gracefully shut down every room.
    pub async fn close_all(&self) {
        let mut rooms = self.inner.lock().await;
        for (_, room) in rooms.drain() {
            room.close().await;
        }
    }

    /// (room count, session count) snapshot for the status endpoint.
    pub async fn stats(&self) -> (usize, usize) {
        let rooms = self.inner.lock().await;
        let mut sessions = 0;
        for room in rooms.values() {
            sessions += room.session_count().await;
        }
        (rooms.len(), sessions)
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, room_id: &str) -> bool {
        self.inner.lock().await.contains_key(room_id)
    }
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
