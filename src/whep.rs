// src/whep.rs
//
// Egress pipeline: WHEP negotiation, the viewer RTCP reader that relays
// keyframe requests, and simulcast layer control.
//
// The viewer's session id is the egress credential: it is carried as the
// bearer token on the WHEP POST and in the layer endpoints' path, while the
// room auth token stays an ingress-only concern.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{AppendHeaders, IntoResponse};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::error::ApiError;
use crate::peer::{create_peer_connection, exchange_sdp};
use crate::room::{SessionId, UserId};
use crate::stream::{PublisherStream, ViewerSession};
use crate::track::MultiCodecTrack;
use crate::whip::bearer_token;
use crate::AppState;

// ─── Layer control DTOs ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct EncodingLayer {
    #[serde(rename = "encodingId")]
    pub encoding_id: String,
}

#[derive(Debug, Serialize)]
pub struct MediaLayers {
    pub layers: Vec<EncodingLayer>,
}

#[derive(Debug, Deserialize)]
pub struct LayerRequest {
    #[serde(rename = "mediaId")]
    #[allow(dead_code)]
    pub media_id: Option<String>,
    #[serde(rename = "encodingId")]
    pub encoding_id: String,
}

// ─── Core operations ────────────────────────────────────────────────────────

/// Negotiate a viewer peer connection onto `streamer_user_id`'s publisher
/// stream and return the answer SDP.
pub async fn whep(
    state: &AppState,
    offer: String,
    viewer_session_id: SessionId,
    streamer_user_id: UserId,
) -> Result<String, ApiError> {
    let (room, viewer) = state
        .rooms
        .find_session(viewer_session_id)
        .await
        .ok_or(ApiError::SessionNotFound)?;
    let streamer = room
        .user_by_id(streamer_user_id)
        .await
        .ok_or(ApiError::StreamerNotFound)?;
    let stream = streamer.stream().ok_or(ApiError::NotStreaming)?;

    let peer_conn = create_peer_connection().await?;
    let video_track = Arc::new(MultiCodecTrack::new("video", "pion"));

    let attach = async {
        peer_conn
            .add_track(stream.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        peer_conn
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
    };
    let rtp_sender = match attach.await {
        Ok(sender) => sender,
        Err(e) => {
            let _ = peer_conn.close().await;
            return Err(e.into());
        }
    };

    register_ice_teardown(&peer_conn, &stream, viewer.id);
    spawn_rtcp_reader(rtp_sender, &stream);

    let answer = match exchange_sdp(&peer_conn, offer).await {
        Ok(answer) => answer,
        Err(e) => {
            let _ = peer_conn.close().await;
            return Err(e);
        }
    };

    stream
        .add_viewer(ViewerSession::new(viewer.id, peer_conn, video_track))
        .await;
    info!(viewer = %viewer.id, streamer = %streamer.id, room = room.id(), "viewer attached to stream");

    Ok(answer)
}

/// Known simulcast layers for the publisher a viewer is attached to, in the
/// WHEP server-sent-events extension shape.
pub async fn whep_layers(
    state: &AppState,
    viewer_session_id: SessionId,
) -> Result<serde_json::Value, ApiError> {
    let (stream, _viewer) = state
        .rooms
        .find_viewer(viewer_session_id)
        .await
        .ok_or(ApiError::NotStreaming)?;

    let layers: Vec<EncodingLayer> = stream
        .layer_labels()
        .await
        .into_iter()
        .map(|label| EncodingLayer {
            encoding_id: label,
        })
        .collect();

    serde_json::to_value(std::collections::HashMap::from([(
        "1",
        MediaLayers { layers },
    )]))
    .map_err(|e| ApiError::Internal(format!("serialize layers: {e}")))
}

/// Switch a viewer onto another simulcast layer and nudge the publisher for
/// a keyframe. An unknown label simply selects a layer no packets match.
pub async fn whep_change_layer(
    state: &AppState,
    viewer_session_id: SessionId,
    encoding_id: &str,
) -> Result<(), ApiError> {
    let (stream, viewer) = state
        .rooms
        .find_viewer(viewer_session_id)
        .await
        .ok_or(ApiError::NotStreaming)?;

    viewer.set_layer(encoding_id);
    stream.request_pli();
    debug!(viewer = %viewer_session_id, layer = encoding_id, "viewer switched layer");
    Ok(())
}

// ─── Peer connection plumbing ───────────────────────────────────────────────

/// ICE failure closes the viewer connection; the closed state detaches the
/// viewer from the publisher.
fn register_ice_teardown(
    peer_conn: &Arc<webrtc::peer_connection::RTCPeerConnection>,
    stream: &Arc<PublisherStream>,
    viewer_session_id: SessionId,
) {
    let weak_pc = Arc::downgrade(peer_conn);
    let weak_stream = Arc::downgrade(stream);
    peer_conn.on_ice_connection_state_change(Box::new(move |ice_state| {
        let weak_pc = weak_pc.clone();
        let weak_stream = weak_stream.clone();
        debug!(viewer = %viewer_session_id, "viewer ICE connection state: {ice_state}");
        Box::pin(async move {
            match ice_state {
                RTCIceConnectionState::Failed => {
                    if let Some(pc) = weak_pc.upgrade() {
                        if let Err(e) = pc.close().await {
                            warn!(viewer = %viewer_session_id, "could not close failed viewer connection: {e}");
                        }
                    }
                }
                RTCIceConnectionState::Closed => {
                    if let Some(stream) = weak_stream.upgrade() {
                        stream.remove_viewer(viewer_session_id).await;
                    }
                }
                _ => {}
            }
        })
    }));
}

/// Relay PictureLossIndication from the viewer onto the publisher's lossy
/// PLI channel. Exits when the sender is torn down.
fn spawn_rtcp_reader(rtp_sender: Arc<RTCRtpSender>, stream: &Arc<PublisherStream>) {
    let weak_stream = Arc::downgrade(stream);
    tokio::spawn(async move {
        loop {
            let packets = match rtp_sender.read_rtcp().await {
                Ok((packets, _)) => packets,
                Err(_) => return,
            };
            let Some(stream) = weak_stream.upgrade() else {
                return;
            };
            for packet in packets {
                if packet
                    .as_any()
                    .downcast_ref::<PictureLossIndication>()
                    .is_some()
                {
                    stream.request_pli();
                }
            }
        }
    });
}

// ─── HTTP handlers ──────────────────────────────────────────────────────────

/// `POST /api/whep/{streamer_user_id}` — subscribe to a publisher.
///
/// The response carries two `Link` headers pointing the client at the layer
/// event stream and the layer selection endpoint for this viewer session.
pub async fn whep_handler(
    State(state): State<Arc<AppState>>,
    Path(streamer_user_id): Path<UserId>,
    headers: HeaderMap,
    offer: String,
) -> Result<impl IntoResponse, ApiError> {
    let credential = bearer_token(&headers)?;
    let viewer_session_id: SessionId = credential
        .parse()
        .map_err(|_| ApiError::SessionNotFound)?;

    let answer = whep(&state, offer, viewer_session_id, streamer_user_id).await?;

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let sse_link = HeaderValue::from_str(&format!(
        "<{host}/api/sse/{viewer_session_id}>; rel=\"urn:ietf:params:whep:ext:core:server-sent-events\"; events=\"layers\""
    ))
    .map_err(|e| ApiError::Internal(format!("link header: {e}")))?;
    let layer_link = HeaderValue::from_str(&format!(
        "<{host}/api/layer/{viewer_session_id}>; rel=\"urn:ietf:params:whep:ext:core:layer\""
    ))
    .map_err(|e| ApiError::Internal(format!("link header: {e}")))?;

    Ok((
        StatusCode::CREATED,
        AppendHeaders([(header::LINK, sse_link), (header::LINK, layer_link)]),
        answer,
    ))
}

/// `POST /api/layer/{viewer_session_id}` — select a simulcast layer.
pub async fn layer_handler(
    State(state): State<Arc<AppState>>,
    Path(viewer_session_id): Path<SessionId>,
    axum::Json(request): axum::Json<LayerRequest>,
) -> Result<StatusCode, ApiError> {
    whep_change_layer(&state, viewer_session_id, &request.encoding_id).await?;
    Ok(StatusCode::OK)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::Rooms;

    fn test_state() -> AppState {
        AppState {
            rooms: Rooms::new(),
        }
    }

    /// Join a publisher and a viewer, start the publisher's stream and
    /// attach the viewer to it directly (no ICE involved).
    async fn attach_viewer(
        state: &AppState,
    ) -> (
        Arc<PublisherStream>,
        SessionId,
        Arc<crate::room::Room>,
        Arc<crate::room::Session>,
    ) {
        let (room, publisher, _rx) = state.rooms.join("r", "tok-a").await.unwrap();
        let (_, viewer, _rx2) = state.rooms.join("r", "tok-b").await.unwrap();

        let pc = create_peer_connection().await.unwrap();
        let stream = room.start_stream(&publisher.user, pc).await.unwrap();

        let viewer_pc = create_peer_connection().await.unwrap();
        let track = Arc::new(MultiCodecTrack::new("video", "pion"));
        stream
            .add_viewer(ViewerSession::new(viewer.id, viewer_pc, track))
            .await;

        (stream, viewer.id, room, publisher)
    }

    #[tokio::test]
    async fn whep_rejects_unknown_sessions() {
        let state = test_state();
        let err = whep(&state, String::new(), SessionId::new_v4(), UserId::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::SessionNotFound));
    }

    #[tokio::test]
    async fn whep_rejects_unknown_streamers() {
        let state = test_state();
        let (_, viewer, _rx) = state.rooms.join("r", "tok").await.unwrap();
        let err = whep(&state, String::new(), viewer.id, UserId::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::StreamerNotFound));
    }

    #[tokio::test]
    async fn whep_rejects_idle_streamers() {
        let state = test_state();
        let (_, viewer, _rx) = state.rooms.join("r", "tok-a").await.unwrap();
        let (_, streamer, _rx2) = state.rooms.join("r", "tok-b").await.unwrap();
        let err = whep(&state, String::new(), viewer.id, streamer.user.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotStreaming));
    }

    #[tokio::test]
    async fn layers_response_shape() {
        let state = test_state();
        let (stream, viewer_id, room, publisher) = attach_viewer(&state).await;
        stream.add_video_layer("q").await;
        stream.add_video_layer("f").await;

        let value = whep_layers(&state, viewer_id).await.unwrap();
        assert_eq!(value["1"]["layers"][0]["encodingId"], "q");
        assert_eq!(value["1"]["layers"][1]["encodingId"], "f");

        room.stop_stream(&publisher.user).await;
    }

    #[tokio::test]
    async fn layers_require_an_attached_viewer() {
        let state = test_state();
        let err = whep_layers(&state, SessionId::new_v4()).await.unwrap_err();
        assert!(matches!(err, ApiError::NotStreaming));
    }

    #[tokio::test]
    async fn change_layer_stores_label_and_requests_keyframe() {
        let state = test_state();
        let (stream, viewer_id, room, publisher) = attach_viewer(&state).await;
        let mut pli_rx = stream.subscribe_pli();

        whep_change_layer(&state, viewer_id, "f").await.unwrap();

        let (_, viewer) = state.rooms.find_viewer(viewer_id).await.unwrap();
        assert_eq!(viewer.current_layer(), "f");
        // Exactly one PLI request was delivered.
        assert!(pli_rx.try_recv().is_ok());
        assert!(pli_rx.try_recv().is_err());

        room.stop_stream(&publisher.user).await;
    }

    #[tokio::test]
    async fn change_layer_switches_forwarding() {
        let state = test_state();
        let (stream, viewer_id, room, publisher) = attach_viewer(&state).await;

        let mut pkt = webrtc::rtp::packet::Packet::default();
        pkt.header.timestamp = 1000;

        // Latch "q" first.
        stream.forward_video_packet(&pkt, "q", 0, false).await;
        whep_change_layer(&state, viewer_id, "f").await.unwrap();

        let (_, viewer) = state.rooms.find_viewer(viewer_id).await.unwrap();
        let seq_before = viewer.sequence_number();

        // "q" is dropped now, "f" is forwarded.
        stream.forward_video_packet(&pkt, "q", 100, false).await;
        assert_eq!(viewer.sequence_number(), seq_before);
        stream.forward_video_packet(&pkt, "f", 100, false).await;
        assert_eq!(viewer.sequence_number(), seq_before + 1);

        room.stop_stream(&publisher.user).await;
    }
}
