use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── SessionError ───────────────────────────────────────────────────────────

/// Every failure the session layer can surface.
///
/// `Clone` so the same error can be handed to a command caller, recorded in
/// the published view and emitted on the event bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("screen capture denied: {0}")]
    ScreenCaptureDenied(String),

    #[error("presence/signaling store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("negotiation with peer '{peer_id}' failed: {reason}")]
    PeerNegotiationFailed { peer_id: String, reason: String },

    #[error("signal from '{peer_id}' has no live connection")]
    StaleSignal { peer_id: String },

    #[error("malformed signaling payload: {0}")]
    InvalidSignal(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Stable machine-readable code, used in JSON envelopes and events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceUnavailable(_) => "device_unavailable",
            Self::ScreenCaptureDenied(_) => "screen_capture_denied",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::PeerNegotiationFailed { .. } => "peer_negotiation_failed",
            Self::StaleSignal { .. } => "stale_signal",
            Self::InvalidSignal(_) => "invalid_signal",
            Self::SessionClosed => "session_closed",
            Self::Config(_) => "config_error",
        }
    }

    /// Only store connectivity loss ends the whole session. Everything else
    /// is local to one peer or one action.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether the store adapter should retry the call that produced this.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn negotiation(peer_id: &str, reason: impl std::fmt::Display) -> Self {
        Self::PeerNegotiationFailed {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidSignal(err.to_string())
    }
}

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

/// Structured error returned by the local control API.
///
/// ```json
/// {
///   "error": {
///     "code": "screen_capture_denied",
///     "message": "screen capture denied: permission dismissed",
///     "status": 403
///   }
/// }
/// ```
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::ScreenCaptureDenied(_) => StatusCode::FORBIDDEN,
            SessionError::SessionClosed => StatusCode::GONE,
            SessionError::DeviceUnavailable(_) => StatusCode::CONFLICT,
            SessionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::StaleSignal { .. } | SessionError::InvalidSignal(_) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::PeerNegotiationFailed { .. } | SessionError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            code: err.code(),
            message: err.to_string(),
            status,
        }
    }
}

impl ApiError {
    /// 404 Not Found with a custom message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: "not_found",
            message: msg.into(),
            status: StatusCode::NOT_FOUND,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn screen_denied_envelope() {
        let err = ApiError::from(SessionError::ScreenCaptureDenied("dismissed".into()));
        let value = body_json(err).await;

        assert_eq!(value["error"]["code"], "screen_capture_denied");
        assert_eq!(value["error"]["message"], "screen capture denied: dismissed");
        assert_eq!(value["error"]["status"], 403);
    }

    #[tokio::test]
    async fn closed_session_is_gone() {
        let response = ApiError::from(SessionError::SessionClosed).into_response();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn store_outage_is_503() {
        let value = body_json(ApiError::from(SessionError::StoreUnavailable(
            "connection refused".into(),
        )))
        .await;
        assert_eq!(value["error"]["code"], "store_unavailable");
        assert_eq!(value["error"]["status"], 503);
    }

    #[test]
    fn only_store_loss_is_fatal() {
        assert!(SessionError::StoreUnavailable("x".into()).is_session_fatal());
        assert!(!SessionError::negotiation("u2", "ice failed").is_session_fatal());
        assert!(!SessionError::DeviceUnavailable("no camera".into()).is_session_fatal());
        assert!(!SessionError::StaleSignal { peer_id: "u2".into() }.is_session_fatal());
    }

    #[test]
    fn negotiation_message_names_peer() {
        let err = SessionError::negotiation("u2", "set remote description");
        assert_eq!(err.code(), "peer_negotiation_failed");
        assert!(err.to_string().contains("'u2'"));
    }
}
