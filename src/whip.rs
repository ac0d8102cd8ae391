// src/whip.rs
//
// Ingress pipeline: WHIP negotiation and the per-track forwarders that move
// publisher RTP into the room.
//
// The publisher POSTs an SDP offer with its auth token as the bearer stream
// key. Audio is mirrored verbatim onto the stream's shared Opus track;
// video is fanned out per viewer with sequence/timestamp rewriting, one
// forwarder per simulcast layer.

use std::sync::{Arc, Weak};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::MIME_TYPE_AV1;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use crate::error::ApiError;
use crate::peer::{create_peer_connection, exchange_sdp};
use crate::room::{Room, User};
use crate::stream::PublisherStream;
use crate::AppState;

/// Layer label for video tracks negotiated without a RID.
const VIDEO_TRACK_LABEL_DEFAULT: &str = "default";

// ─── Bearer token helper ────────────────────────────────────────────────────

pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::InvalidAuthToken)
}

// ─── Core operations ────────────────────────────────────────────────────────

/// Negotiate a publisher peer connection for the user joined with
/// `auth_token` and return the answer SDP.
pub async fn whip(state: &AppState, offer: String, auth_token: &str) -> Result<String, ApiError> {
    let (room, user) = state
        .rooms
        .find_user_by_auth(auth_token)
        .await
        .ok_or(ApiError::NotInRoom)?;

    let peer_conn = create_peer_connection().await?;

    let stream = match room.start_stream(&user, Arc::clone(&peer_conn)).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = peer_conn.close().await;
            return Err(e);
        }
    };
    info!(user = %user.id, room = room.id(), "initializing user stream");

    register_on_track(&peer_conn, &stream);
    register_ice_teardown(&peer_conn, &room, &user);

    match exchange_sdp(&peer_conn, offer).await {
        Ok(answer) => Ok(answer),
        Err(e) => {
            room.stop_stream(&user).await;
            Err(e)
        }
    }
}

/// Stop publishing for the user joined with `auth_token`.
pub async fn finish_whip(state: &AppState, auth_token: &str) -> Result<(), ApiError> {
    let (room, user) = state
        .rooms
        .find_user_by_auth(auth_token)
        .await
        .ok_or(ApiError::NotInRoom)?;
    room.stop_stream(&user).await;
    Ok(())
}

// ─── Peer connection callbacks ──────────────────────────────────────────────

/// Route each inbound remote track to the matching forwarder. The stream is
/// held weakly: once the publisher stops, late track events are ignored.
fn register_on_track(peer_conn: &Arc<RTCPeerConnection>, stream: &Arc<PublisherStream>) {
    let weak_stream = Arc::downgrade(stream);
    let weak_pc = Arc::downgrade(peer_conn);
    peer_conn.on_track(Box::new(move |track, _receiver, _transceiver| {
        let weak_stream = weak_stream.clone();
        let weak_pc = weak_pc.clone();
        Box::pin(async move {
            let Some(stream) = weak_stream.upgrade() else {
                return;
            };
            let mime_type = track.codec().capability.mime_type.clone();
            let cancel = stream.cancellation();
            if mime_type.starts_with("audio/") {
                tokio::spawn(forward_audio(track, stream.audio_track(), cancel));
            } else {
                tokio::spawn(forward_video(track, stream, weak_pc, cancel));
            }
        })
    }));
}

/// ICE failure closes the connection; the closed state is the authoritative
/// stream-teardown trigger.
fn register_ice_teardown(peer_conn: &Arc<RTCPeerConnection>, room: &Arc<Room>, user: &Arc<User>) {
    let weak_pc = Arc::downgrade(peer_conn);
    let room = Arc::clone(room);
    let user = Arc::clone(user);
    peer_conn.on_ice_connection_state_change(Box::new(move |ice_state| {
        let weak_pc = weak_pc.clone();
        let room = Arc::clone(&room);
        let user = Arc::clone(&user);
        debug!(user = %user.id, "publisher ICE connection state: {ice_state}");
        Box::pin(async move {
            match ice_state {
                RTCIceConnectionState::Failed => {
                    if let Some(pc) = weak_pc.upgrade() {
                        if let Err(e) = pc.close().await {
                            warn!(user = %user.id, "could not close failed publisher connection: {e}");
                        }
                    }
                }
                RTCIceConnectionState::Closed => {
                    room.stop_stream(&user).await;
                }
                _ => {}
            }
        })
    }));
}

// ─── Forwarders ─────────────────────────────────────────────────────────────

/// Mirror publisher audio onto the stream's shared egress track.
async fn forward_audio(
    remote_track: Arc<TrackRemote>,
    audio_track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = remote_track.read_rtp() => {
                let pkt = match result {
                    Ok((pkt, _)) => pkt,
                    Err(e) => {
                        debug!("audio forwarder ended: {e}");
                        return;
                    }
                };
                if let Err(e) = audio_track.write_rtp(&pkt).await {
                    warn!("could not write audio packet: {e}");
                    return;
                }
            }
        }
    }
}

/// Forward one simulcast layer of publisher video to every viewer.
async fn forward_video(
    remote_track: Arc<TrackRemote>,
    stream: Arc<PublisherStream>,
    weak_pc: Weak<RTCPeerConnection>,
    cancel: CancellationToken,
) {
    let rid = remote_track.rid();
    let label = if rid.is_empty() {
        VIDEO_TRACK_LABEL_DEFAULT.to_owned()
    } else {
        rid.to_string()
    };
    stream.add_video_layer(&label).await;

    let is_av1 = remote_track
        .codec()
        .capability
        .mime_type
        .eq_ignore_ascii_case(MIME_TYPE_AV1);

    spawn_pli_responder(
        stream.subscribe_pli(),
        weak_pc,
        remote_track.ssrc(),
        cancel.clone(),
    );

    let mut last_timestamp = 0u32;
    loop {
        let pkt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = remote_track.read_rtp() => match result {
                Ok((pkt, _)) => pkt,
                Err(e) => {
                    debug!(layer = %label, "video forwarder ended: {e}");
                    return;
                }
            },
        };

        // Publisher-side timestamp delta, applied verbatim to every viewer
        // so a layer switch never resets their clock.
        let mut time_diff = pkt.header.timestamp.wrapping_sub(last_timestamp);
        if last_timestamp == 0 {
            time_diff = 0;
        }
        last_timestamp = pkt.header.timestamp;

        let disconnected = stream
            .forward_video_packet(&pkt, &label, time_diff, is_av1)
            .await;
        if !disconnected.is_empty() {
            stream.prune_viewers(&disconnected).await;
        }
    }
}

/// Relay viewer keyframe requests back to the publisher as RTCP PLI.
fn spawn_pli_responder(
    mut pli_rx: tokio::sync::broadcast::Receiver<()>,
    weak_pc: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return,
                result = pli_rx.recv() => result,
            };
            match received {
                // A lagged receiver skipped coalesced requests; one PLI
                // still satisfies all of them.
                Ok(()) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    let Some(pc) = weak_pc.upgrade() else {
                        return;
                    };
                    let pli = PictureLossIndication {
                        sender_ssrc: 0,
                        media_ssrc,
                    };
                    if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

// ─── HTTP handlers ──────────────────────────────────────────────────────────

/// `POST /api/whip` — publish into the room the token is joined to.
pub async fn whip_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    offer: String,
) -> Result<impl IntoResponse, ApiError> {
    let auth_token = bearer_token(&headers)?;
    let answer = whip(&state, offer, auth_token).await?;
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, "/api/whip")],
        answer,
    ))
}

/// `DELETE /api/whip` — stop publishing.
pub async fn finish_whip_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let auth_token = bearer_token(&headers)?;
    finish_whip(&state, auth_token).await?;
    Ok(StatusCode::OK)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
