// src/stream.rs
//
// Publisher-side stream state and the per-viewer egress sessions attached
// to it. The ingress forwarders (src/whip.rs) fan packets out through
// `forward_video_packet`; the egress pipeline (src/whep.rs) attaches and
// detaches viewers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::room::SessionId;
use crate::track::MultiCodecTrack;

/// PLI requests are a lossy nudge; one coalesced request is enough to make
/// the publisher emit a keyframe, so late subscribers skipping stale
/// requests is the intended behavior.
const PLI_CHANNEL_CAPACITY: usize = 50;

/// Initial rewritten timestamp for a fresh viewer.
const VIEWER_TIMESTAMP_BASE: u32 = 50_000;

// ---------------------------------------------------------------------------
// PublisherStream
// ---------------------------------------------------------------------------

struct StreamState {
    /// Known simulcast layer labels, in the order they were first seen.
    layers: Vec<String>,
    viewers: HashMap<SessionId, Arc<ViewerSession>>,
}

/// One user's active ingress stream and everything hanging off it.
///
/// The audio track is shared by every viewer peer connection directly; video
/// goes through the per-viewer rewrite in [`ViewerSession`].
pub struct PublisherStream {
    peer_conn: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticRTP>,
    pli_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
    state: RwLock<StreamState>,
}

impl std::fmt::Debug for PublisherStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherStream").finish_non_exhaustive()
    }
}

impl PublisherStream {
    pub fn new(peer_conn: Arc<RTCPeerConnection>) -> Arc<Self> {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "pion".to_owned(),
        ));
        let (pli_tx, _) = broadcast::channel(PLI_CHANNEL_CAPACITY);
        Arc::new(Self {
            peer_conn,
            audio_track,
            pli_tx,
            cancel: CancellationToken::new(),
            state: RwLock::new(StreamState {
                layers: Vec::with_capacity(1),
                viewers: HashMap::new(),
            }),
        })
    }

    pub fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        Arc::clone(&self.audio_track)
    }

    /// Token cancelled when the stream stops; forwarder tasks select on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the publisher for a keyframe. Never blocks; requests beyond the
    /// channel capacity are coalesced.
    pub fn request_pli(&self) {
        let _ = self.pli_tx.send(());
    }

    pub fn subscribe_pli(&self) -> broadcast::Receiver<()> {
        self.pli_tx.subscribe()
    }

    /// Record a simulcast layer label, keeping first-seen order. Idempotent.
    pub async fn add_video_layer(&self, label: &str) {
        let mut state = self.state.write().await;
        if state.layers.iter().any(|l| l == label) {
            return;
        }
        state.layers.push(label.to_owned());
    }

    pub async fn layer_labels(&self) -> Vec<String> {
        self.state.read().await.layers.clone()
    }

    /// Attach a viewer. A session re-subscribing to the same publisher
    /// replaces its previous viewer session, which is closed.
    pub async fn add_viewer(&self, viewer: Arc<ViewerSession>) {
        let replaced = {
            let mut state = self.state.write().await;
            state.viewers.insert(viewer.session_id(), viewer)
        };
        if let Some(old) = replaced {
            debug!(session = %old.session_id(), "replacing existing viewer session");
            old.close().await;
        }
    }

    /// Detach a viewer and close its peer connection. No-op if absent.
    pub async fn remove_viewer(&self, session_id: SessionId) {
        let viewer = { self.state.write().await.viewers.remove(&session_id) };
        if let Some(viewer) = viewer {
            viewer.close().await;
        }
    }

    /// Drop viewers whose last write failed. Their peer connections are left
    /// to their own ICE teardown path.
    pub async fn prune_viewers(&self, session_ids: &[SessionId]) {
        let mut state = self.state.write().await;
        for id in session_ids {
            state.viewers.remove(id);
        }
    }

    pub async fn viewer(&self, session_id: SessionId) -> Option<Arc<ViewerSession>> {
        self.state.read().await.viewers.get(&session_id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn viewer_count(&self) -> usize {
        self.state.read().await.viewers.len()
    }

    /// Fan one video packet out to every attached viewer, dispatching
    /// synchronously under the read lock so per-layer packet order is
    /// preserved. Returns the ids of viewers whose write failed.
    pub async fn forward_video_packet(
        &self,
        pkt: &webrtc::rtp::packet::Packet,
        layer: &str,
        time_diff: u32,
        is_av1: bool,
    ) -> Vec<SessionId> {
        let state = self.state.read().await;
        let mut disconnected = Vec::new();
        for (session_id, viewer) in state.viewers.iter() {
            if let Err(e) = viewer.send_video_packet(pkt, layer, time_diff, is_av1).await {
                warn!(viewer = %session_id, "could not send video packet: {e}");
                disconnected.push(*session_id);
            }
        }
        disconnected
    }

    /// Tear the stream down: cancel forwarders, close the ingress peer
    /// connection, then close and drain every viewer.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Err(e) = self.peer_conn.close().await {
            warn!("could not close ingress peer connection: {e}");
        }
        let viewers: Vec<Arc<ViewerSession>> = {
            let mut state = self.state.write().await;
            state.viewers.drain().map(|(_, v)| v).collect()
        };
        for viewer in viewers {
            viewer.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// ViewerSession
// ---------------------------------------------------------------------------

/// Per-viewer egress state: the selected simulcast layer and the rewritten
/// sequence/timestamp so the viewer observes one monotonic stream across
/// layer switches.
pub struct ViewerSession {
    session_id: SessionId,
    peer_conn: Arc<RTCPeerConnection>,
    video_track: Arc<MultiCodecTrack>,
    /// Empty until the first packet arrives; first layer seen wins.
    current_layer: std::sync::RwLock<String>,
    sequence_number: AtomicU16,
    timestamp: AtomicU32,
}

impl ViewerSession {
    pub fn new(
        session_id: SessionId,
        peer_conn: Arc<RTCPeerConnection>,
        video_track: Arc<MultiCodecTrack>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            peer_conn,
            video_track,
            current_layer: std::sync::RwLock::new(String::new()),
            sequence_number: AtomicU16::new(0),
            timestamp: AtomicU32::new(VIEWER_TIMESTAMP_BASE),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[cfg(test)]
    pub(crate) fn current_layer(&self) -> String {
        self.current_layer.read().unwrap().clone()
    }

    /// Select a simulcast layer. Packets from other layers are dropped from
    /// now on; the caller nudges the publisher for a keyframe.
    pub fn set_layer(&self, layer: &str) {
        let mut current = self.current_layer.write().unwrap();
        current.clear();
        current.push_str(layer);
    }

    /// Forward one publisher packet to this viewer.
    ///
    /// Latches the first layer seen, silently drops other layers, and
    /// rewrites sequence number (+1, wrapping) and timestamp (+`time_diff`,
    /// wrapping) so the egress stream stays monotonic. A write error is the
    /// viewer-disconnect signal surfaced to the forwarder.
    pub async fn send_video_packet(
        &self,
        pkt: &webrtc::rtp::packet::Packet,
        layer: &str,
        time_diff: u32,
        is_av1: bool,
    ) -> Result<(), webrtc::Error> {
        {
            let mut current = self.current_layer.write().unwrap();
            if current.is_empty() {
                current.push_str(layer);
            } else if current.as_str() != layer {
                return Ok(());
            }
        }

        let sequence_number = self
            .sequence_number
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let timestamp = self
            .timestamp
            .fetch_add(time_diff, Ordering::Relaxed)
            .wrapping_add(time_diff);

        let mut out = pkt.clone();
        out.header.sequence_number = sequence_number;
        out.header.timestamp = timestamp;

        self.video_track.write_rtp(&mut out, is_av1).await
    }

    /// Close the egress peer connection. Safe to call more than once.
    pub async fn close(&self) {
        if let Err(e) = self.peer_conn.close().await {
            warn!(session = %self.session_id, "could not close viewer peer connection: {e}");
        }
    }

    #[cfg(test)]
    pub(crate) fn sequence_number(&self) -> u16 {
        self.sequence_number.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::create_peer_connection;

    fn video_packet(timestamp: u32) -> webrtc::rtp::packet::Packet {
        let mut pkt = webrtc::rtp::packet::Packet::default();
        pkt.header.timestamp = timestamp;
        pkt
    }

    async fn test_viewer() -> (Arc<ViewerSession>, Arc<RTCPeerConnection>) {
        let pc = create_peer_connection().await.unwrap();
        let track = Arc::new(MultiCodecTrack::new("video", "pion"));
        (
            ViewerSession::new(SessionId::new_v4(), Arc::clone(&pc), track),
            pc,
        )
    }

    #[tokio::test]
    async fn first_layer_seen_wins() {
        let (viewer, pc) = test_viewer().await;

        viewer
            .send_video_packet(&video_packet(1000), "q", 0, false)
            .await
            .unwrap();
        assert_eq!(viewer.current_layer(), "q");
        assert_eq!(viewer.sequence_number(), 1);

        // A packet from another layer is dropped without touching state.
        viewer
            .send_video_packet(&video_packet(1100), "f", 100, false)
            .await
            .unwrap();
        assert_eq!(viewer.current_layer(), "q");
        assert_eq!(viewer.sequence_number(), 1);
        assert_eq!(viewer.timestamp(), VIEWER_TIMESTAMP_BASE);

        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn sequence_and_timestamp_rewrite() {
        let (viewer, pc) = test_viewer().await;

        viewer
            .send_video_packet(&video_packet(1000), "q", 0, false)
            .await
            .unwrap();
        viewer
            .send_video_packet(&video_packet(4000), "q", 3000, false)
            .await
            .unwrap();
        viewer
            .send_video_packet(&video_packet(7000), "q", 3000, false)
            .await
            .unwrap();

        assert_eq!(viewer.sequence_number(), 3);
        assert_eq!(viewer.timestamp(), VIEWER_TIMESTAMP_BASE + 6000);

        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn timestamp_wraps() {
        let (viewer, pc) = test_viewer().await;

        viewer
            .send_video_packet(&video_packet(0), "q", u32::MAX, false)
            .await
            .unwrap();
        assert_eq!(viewer.timestamp(), VIEWER_TIMESTAMP_BASE.wrapping_add(u32::MAX));

        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn layer_switch_keeps_counters_monotonic() {
        let (viewer, pc) = test_viewer().await;

        viewer
            .send_video_packet(&video_packet(1000), "q", 0, false)
            .await
            .unwrap();
        viewer.set_layer("f");
        // Old layer is dropped now.
        viewer
            .send_video_packet(&video_packet(2000), "q", 1000, false)
            .await
            .unwrap();
        assert_eq!(viewer.sequence_number(), 1);
        // New layer carries the publisher-side delta, no reset.
        viewer
            .send_video_packet(&video_packet(2000), "f", 1000, false)
            .await
            .unwrap();
        assert_eq!(viewer.sequence_number(), 2);
        assert_eq!(viewer.timestamp(), VIEWER_TIMESTAMP_BASE + 1000);

        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn layer_labels_are_ordered_and_deduplicated() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));

        stream.add_video_layer("q").await;
        stream.add_video_layer("h").await;
        stream.add_video_layer("q").await;
        stream.add_video_layer("f").await;

        assert_eq!(stream.layer_labels().await, vec!["q", "h", "f"]);
        stream.stop().await;
    }

    #[tokio::test]
    async fn fanout_reports_no_failures_for_healthy_viewers() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));
        let (viewer, viewer_pc) = test_viewer().await;
        stream.add_viewer(Arc::clone(&viewer)).await;

        let failed = stream
            .forward_video_packet(&video_packet(1000), "q", 0, false)
            .await;
        assert!(failed.is_empty());
        assert_eq!(viewer.sequence_number(), 1);

        stream.stop().await;
        viewer_pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn remove_viewer_is_idempotent() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));
        let (viewer, viewer_pc) = test_viewer().await;
        let id = viewer.session_id();
        stream.add_viewer(viewer).await;

        assert_eq!(stream.viewer_count().await, 1);
        stream.remove_viewer(id).await;
        stream.remove_viewer(id).await;
        assert_eq!(stream.viewer_count().await, 0);

        stream.stop().await;
        viewer_pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn prune_leaves_peer_connection_open() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));
        let (viewer, viewer_pc) = test_viewer().await;
        let id = viewer.session_id();
        stream.add_viewer(viewer).await;

        stream.prune_viewers(&[id]).await;
        assert_eq!(stream.viewer_count().await, 0);

        stream.stop().await;
        viewer_pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn pli_requests_are_lossy_and_coalesced() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));

        // No subscriber yet: requests are dropped, not an error.
        stream.request_pli();

        let mut rx = stream.subscribe_pli();
        stream.request_pli();
        assert!(rx.recv().await.is_ok());

        stream.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_forwarders_and_drains_viewers() {
        let pc = create_peer_connection().await.unwrap();
        let stream = PublisherStream::new(Arc::clone(&pc));
        let (viewer, viewer_pc) = test_viewer().await;
        stream.add_viewer(viewer).await;

        let cancel = stream.cancellation();
        assert!(!cancel.is_cancelled());
        stream.stop().await;
        assert!(cancel.is_cancelled());
        assert_eq!(stream.viewer_count().await, 0);

        viewer_pc.close().await.unwrap();
    }
}
