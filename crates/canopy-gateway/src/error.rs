//! Gateway errors and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use http_body_util::LengthLimitError;
use serde::Serialize;

/// JSON error body returned for every gateway-generated failure.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Gateway-related errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing or invalid configuration. Never silently defaulted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Upstream could not be reached or refused the connection.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered with a non-success status before any bytes were
    /// relayed.
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Server at capacity ({0} sessions)")]
    AtCapacity(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::BadRequest(_) | GatewayError::InvalidUpload(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::AtCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Io(_) | GatewayError::AddrParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "CONFIGURATION_ERROR",
            GatewayError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::BadRequest(_) => "INVALID_REQUEST",
            GatewayError::InvalidUpload(_) => "INVALID_UPLOAD",
            GatewayError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            GatewayError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            GatewayError::AtCapacity(_) => "CAPACITY_EXCEEDED",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Io(_) | GatewayError::AddrParse(_) => "INTERNAL_ERROR",
        }
    }

    /// Classify a failed request-body read. Hitting the configured limit is
    /// a 413, anything else a 400.
    pub(crate) fn body_read(err: axum::Error, max_bytes: usize) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(cause) = source {
            if cause.is::<LengthLimitError>() {
                return GatewayError::PayloadTooLarge(max_bytes);
            }
            source = cause.source();
        }
        GatewayError::BadRequest(format!("Failed to read request body: {}", err))
    }

    /// Text shown to the client. Upstream-unavailable causes stay in the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::UpstreamUnavailable(_) => "Upstream service unavailable".to_string(),
            GatewayError::Io(_) | GatewayError::AddrParse(_) => "Internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<canopy_config::ConfigError> for GatewayError {
    fn from(err: canopy_config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{}", self);
        } else {
            tracing::debug!(code = self.code(), "{}", self);
        }

        let body = ErrorResponse {
            error: self.public_message(),
            code: self.code().to_string(),
            status: matches!(self, GatewayError::Upstream { .. }).then_some(status.as_u16()),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, Bytes};

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(
            GatewayError::Config("no upstream".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::InvalidUpload("missing file".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::AtCapacity(10).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::Upstream {
                status: StatusCode::TOO_MANY_REQUESTS,
                message: "slow down".into()
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_body_read_classification() {
        let err = axum::body::to_bytes(Body::from(vec![b'x'; 64]), 16)
            .await
            .unwrap_err();
        assert!(matches!(
            GatewayError::body_read(err, 16),
            GatewayError::PayloadTooLarge(16)
        ));

        let broken = futures_util::stream::iter(vec![Err::<Bytes, _>(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client went away",
        ))]);
        let err = axum::body::to_bytes(Body::from_stream(broken), 16)
            .await
            .unwrap_err();
        assert!(matches!(
            GatewayError::body_read(err, 16),
            GatewayError::BadRequest(_)
        ));
    }

    #[test]
    fn test_upstream_cause_is_not_leaked() {
        let err = GatewayError::UpstreamUnavailable("tcp connect 10.0.0.7:8000 refused".into());
        assert_eq!(err.public_message(), "Upstream service unavailable");
    }

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse {
            error: "slow down".into(),
            code: "UPSTREAM_ERROR".into(),
            status: Some(429),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 429);

        let body = ErrorResponse {
            error: "x".into(),
            code: "NOT_FOUND".into(),
            status: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("status").is_none());
    }
}
