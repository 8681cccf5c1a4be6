//! Proxy error taxonomy and the JSON error envelope returned to clients.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde_json::Value;

/// Errors originated by the proxy itself (as opposed to errors propagated
/// verbatim from the upstream API).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProxyError {
    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Non-retryable upstream rejection: status + body propagated verbatim.
    #[error("upstream api error: {status}")]
    Upstream { status: StatusCode, body: Value },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn envelope(message: &str, error_type: &str, code: Option<&str>) -> Value {
        serde_json::json!({
            "error": {
                "message": message,
                "type": error_type,
                "param": Value::Null,
                "code": code,
            }
        })
    }

    /// The status code this error would produce, needed by the metrics scope
    /// guard which must record a status even when the handler returns early.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Validation(_) => StatusCode::BAD_REQUEST,
            ProxyError::ServiceUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Authentication(msg) => {
                tracing::warn!(error = %msg, "authentication_error");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(Self::envelope(&msg, "authentication_error", Some("invalid_api_key"))),
                )
                    .into_response()
            }
            ProxyError::RateLimited(msg) => {
                tracing::info!(error = %msg, "rate_limit_exceeded");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [("retry-after", "60")],
                    Json(Self::envelope(&msg, "rate_limit_exceeded", Some("rate_limit_exceeded"))),
                )
                    .into_response()
            }
            ProxyError::Validation(msg) => {
                tracing::warn!(error = %msg, "validation_error");
                (
                    StatusCode::BAD_REQUEST,
                    Json(Self::envelope(&msg, "validation_error", None)),
                )
                    .into_response()
            }
            ProxyError::ServiceUnavailable(msg) => {
                tracing::error!(error = %msg, "service_unavailable");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(Self::envelope(&msg, "service_unavailable", None)),
                )
                    .into_response()
            }
            ProxyError::Upstream { status, body } => {
                tracing::warn!(status = status.as_u16(), "upstream_api_error");
                (status, Json(body)).into_response()
            }
            ProxyError::Internal(msg) => {
                tracing::error!(error = %msg, "internal_error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(Self::envelope(&msg, "internal_error", None)),
                )
                    .into_response()
            }
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_matches_variant() {
        assert_eq!(
            ProxyError::RateLimited("x".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::Upstream {
                status: StatusCode::NOT_FOUND,
                body: serde_json::json!({}),
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
