// src/peer.rs
//
// Peer connection construction and the shared SDP offer/answer exchange.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::ApiError;

/// ICE gathering is bounded so a slow candidate pool cannot stall the
/// signaling exchange indefinitely.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

// ─── PeerConnection factory ─────────────────────────────────────────────────

/// Create a new `RTCPeerConnection` with the default codec set and
/// interceptors. TURN/STUN provisioning is up to the clients, so the
/// configuration carries no ICE servers.
pub async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>, ApiError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api.new_peer_connection(RTCConfiguration::default()).await?;
    Ok(Arc::new(pc))
}

// ─── ICE gathering helper ───────────────────────────────────────────────────

/// Wait until ICE gathering completes or the timeout elapses.
pub async fn wait_for_ice(pc: &Arc<RTCPeerConnection>, timeout: Duration) {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Arc::new(std::sync::Mutex::new(Some(tx)));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        if state == RTCIceGathererState::Complete {
            if let Some(t) = tx.lock().unwrap().take() {
                let _ = t.send(());
            }
        }
        Box::pin(async {})
    }));
    let _ = tokio::time::timeout(timeout, rx).await;
}

// ─── SDP exchange helper ────────────────────────────────────────────────────

/// Run the server side of an offer/answer exchange and return the local SDP
/// once ICE gathering has finished (the answer then carries every candidate,
/// so no trickle signaling channel is needed).
pub async fn exchange_sdp(
    pc: &Arc<RTCPeerConnection>,
    offer_sdp: String,
) -> Result<String, ApiError> {
    let offer = RTCSessionDescription::offer(offer_sdp).map_err(|e| {
        warn!("Invalid SDP offer: {e}");
        ApiError::PeerConnection(e)
    })?;

    pc.set_remote_description(offer).await?;

    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer).await?;

    wait_for_ice(pc, ICE_GATHER_TIMEOUT).await;

    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| ApiError::Internal("local description unavailable after ICE gathering".into()))?;

    Ok(local_desc.sdp)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
