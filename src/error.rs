use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Error surfaced by the room/session/media core, serialised to JSON by the
/// transport layer.
///
/// ```json
/// {
///   "error": {
///     "code": "not_streaming",
///     "message": "user is not streaming",
///     "status": 404
///   }
/// }
/// ```
///
/// Data-plane failures (RTP read/write inside a forwarder) never surface
/// here; they tear down the affected worker and peer connection instead.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The auth token is empty or 1024 characters or longer.
    #[error("invalid auth token")]
    InvalidAuthToken,

    /// Ingress operation for an auth token not joined to any room.
    #[error("not connected to any room")]
    NotInRoom,

    /// Egress operation referencing an unknown session id.
    #[error("unknown session")]
    SessionNotFound,

    /// WHEP target user is not a member of the viewer's room.
    #[error("streamer not found")]
    StreamerNotFound,

    /// WHEP target user has no active publisher stream.
    #[error("user is not streaming")]
    NotStreaming,

    /// WHIP while the user's stream slot is already occupied.
    #[error("already streaming")]
    AlreadyStreaming,

    /// The WebRTC stack failed to construct a peer connection or negotiate.
    #[error("peer connection failure: {0}")]
    PeerConnection(#[from] webrtc::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code carried in the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAuthToken => "invalid_auth_token",
            Self::NotInRoom => "not_in_room",
            Self::SessionNotFound => "session_not_found",
            Self::StreamerNotFound => "streamer_not_found",
            Self::NotStreaming => "not_streaming",
            Self::AlreadyStreaming => "already_streaming",
            Self::PeerConnection(_) => "peer_connection_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidAuthToken => StatusCode::BAD_REQUEST,
            Self::NotInRoom => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound => StatusCode::UNAUTHORIZED,
            Self::StreamerNotFound => StatusCode::NOT_FOUND,
            Self::NotStreaming => StatusCode::NOT_FOUND,
            Self::AlreadyStreaming => StatusCode::CONFLICT,
            Self::PeerConnection(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ─── IntoResponse ───────────────────────────────────────────────────────────

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(code = self.code(), status = status.as_u16(), "{message}");
        } else {
            tracing::warn!(code = self.code(), status = status.as_u16(), "{message}");
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message,
                status: status.as_u16(),
            },
        };

        (status, Json(envelope)).into_response()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::response::IntoResponse;

    /// Helper: convert an `ApiError` into its JSON body string.
    async fn body_string(err: ApiError) -> String {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let json = body_string(ApiError::NotStreaming).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["error"]["code"], "not_streaming");
        assert_eq!(value["error"]["message"], "user is not streaming");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_codes() {
        assert_eq!(
            ApiError::InvalidAuthToken.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::SessionNotFound.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::AlreadyStreaming.into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn webrtc_errors_map_to_500() {
        let err = ApiError::from(webrtc::Error::new("negotiation failed".to_owned()));
        assert_eq!(err.code(), "peer_connection_failed");

        let json = body_string(err).await;
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["error"]["status"], 500);
    }
}
