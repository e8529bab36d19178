use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shared bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("collaborator call failed: {0}")]
    Collaborator(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("hub is shutting down")]
    ShuttingDown,
}

impl HubError {
    /// Whether the failure is transient. The hub itself never retries; this
    /// is surfaced for collaborators and logs.
    pub fn is_retryable(&self) -> bool {
        match self {
            HubError::BusUnavailable(_) | HubError::Timeout(_) => true,
            HubError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            HubError::Collaborator(_) => true,
            _ => false,
        }
    }

    /// Error code reported to WebSocket clients in an `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::BadRequest(_) | HubError::Serialization(_) => "invalid_payload",
            HubError::Unauthorized => "unauthorized",
            _ => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::BadRequest(_) | HubError::Serialization(_) => StatusCode::BAD_REQUEST,
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::ShuttingDown | HubError::BusUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            HubError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_codes() {
        assert_eq!(HubError::BadRequest("x".into()).code(), "invalid_payload");
        assert_eq!(HubError::Collaborator("down".into()).code(), "internal_error");
        assert_eq!(
            HubError::Timeout(Duration::from_millis(5)).code(),
            "internal_error"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(HubError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(HubError::BusUnavailable("down".into()).is_retryable());
        assert!(!HubError::Unauthorized.is_retryable());
        assert!(!HubError::BadRequest("nope".into()).is_retryable());
    }

    #[test]
    fn http_status_mapping() {
        assert_eq!(HubError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            HubError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
