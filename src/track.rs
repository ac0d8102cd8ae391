// src/track.rs
//
// Egress video track that can carry more than one negotiated codec.
//
// Publisher RTP is forwarded without transcoding, so a viewer's outbound
// track must stamp each packet with the payload type the viewer negotiated
// for the codec the packet actually carries. AV1 is the one codec that
// needs a distinct marshal path, so every write is tagged AV1 / non-AV1
// and the matching payload type is applied before the packet reaches the
// wire.
//
// ────────────────────────────────────────────────────────────────────────────

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::MIME_TYPE_AV1;
use webrtc::error::{Error, Result};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::{PayloadType, SSRC};
use webrtc::track::track_local::{TrackLocal, TrackLocalContext, TrackLocalWriter};

/// Per-negotiation binding captured when the track is attached to a sender.
#[derive(Clone)]
struct Binding {
    ssrc: SSRC,
    /// Payload type for the primary (non-AV1) negotiated video codec.
    payload_type: PayloadType,
    /// Payload type for AV1, when the viewer negotiated it.
    av1_payload_type: PayloadType,
    write_stream: Option<Arc<dyn TrackLocalWriter + Send + Sync>>,
}

/// Outbound video track fed by the publisher-side forwarder.
///
/// Writes before `bind` (the viewer has not finished negotiating) are
/// silently dropped; the viewer picks the stream up mid-flight once bound.
pub struct MultiCodecTrack {
    id: String,
    stream_id: String,
    binding: std::sync::Mutex<Option<Binding>>,
}

impl MultiCodecTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            binding: std::sync::Mutex::new(None),
        }
    }

    /// Write one RTP packet, stamping SSRC and the payload type negotiated
    /// for the codec the packet carries.
    pub async fn write_rtp(
        &self,
        pkt: &mut webrtc::rtp::packet::Packet,
        is_av1: bool,
    ) -> Result<()> {
        let binding = { self.binding.lock().unwrap().clone() };
        let Some(binding) = binding else {
            return Ok(());
        };
        let Some(write_stream) = binding.write_stream else {
            return Ok(());
        };

        pkt.header.ssrc = binding.ssrc;
        pkt.header.payload_type = if is_av1 {
            binding.av1_payload_type
        } else {
            binding.payload_type
        };

        write_stream.write_rtp(pkt).await.map(|_| ())
    }
}

fn is_av1_codec(codec: &RTCRtpCodecParameters) -> bool {
    codec
        .capability
        .mime_type
        .eq_ignore_ascii_case(MIME_TYPE_AV1)
}

#[async_trait]
impl TrackLocal for MultiCodecTrack {
    async fn bind(&self, t: &TrackLocalContext) -> Result<RTCRtpCodecParameters> {
        let codecs = t.codec_parameters();

        let av1 = codecs.iter().find(|c| is_av1_codec(c));
        let primary = codecs.iter().find(|c| !is_av1_codec(c));
        let chosen = primary
            .or(av1)
            .cloned()
            .ok_or(Error::ErrUnsupportedCodec)?;

        *self.binding.lock().unwrap() = Some(Binding {
            ssrc: t.ssrc(),
            payload_type: chosen.payload_type,
            av1_payload_type: av1.map(|c| c.payload_type).unwrap_or(chosen.payload_type),
            write_stream: t.write_stream(),
        });

        Ok(chosen)
    }

    async fn unbind(&self, _t: &TrackLocalContext) -> Result<()> {
        if self.binding.lock().unwrap().take().is_none() {
            return Err(Error::ErrUnbindFailed);
        }
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn stream_id(&self) -> &str {
        &self.stream_id
    }

    fn kind(&self) -> RTPCodecType {
        RTPCodecType::Video
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
