//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Seconds a caller is told to wait before retrying a 503
const RETRY_AFTER_SECS: &str = "2";

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Credential header absent or unreadable
    MissingCredential,
    /// Identity service rejected the credential
    Unauthorized,
    /// Tenant instance could not be created or started in time
    InstanceUnavailable,
    /// Identity service or container runtime unreachable
    UpstreamUnreachable,
    /// Backend kept rejecting the session after a fresh retry
    SessionRejected,
    /// Instance did not answer within the request timeout
    RequestTimeout,
    /// Failed to connect to the instance
    ConnectionFailed,
    /// Operator endpoint called without the operator token
    Forbidden,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingCredential => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::InstanceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpstreamUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::SessionRejected => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingCredential => "MISSING_CREDENTIAL",
            ProxyErrorCode::Unauthorized => "UNAUTHORIZED",
            ProxyErrorCode::InstanceUnavailable => "INSTANCE_UNAVAILABLE",
            ProxyErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ProxyErrorCode::SessionRejected => "SESSION_REJECTED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::Forbidden => "FORBIDDEN",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyErrorCode::InstanceUnavailable | ProxyErrorCode::UpstreamUnreachable
        )
    }
}

/// Failures resolved at the router and turned into a response
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing credential header")]
    MissingCredential,

    #[error("credential rejected by identity service")]
    Unauthorized,

    #[error("instance unavailable: {0}")]
    InstanceUnavailable(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("backend rejected session after retry")]
    SessionRejected,

    #[error("instance did not respond within {0} seconds")]
    RequestTimeout(u64),

    #[error("failed to reach instance: {0}")]
    ConnectionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GatewayError::MissingCredential => ProxyErrorCode::MissingCredential,
            GatewayError::Unauthorized => ProxyErrorCode::Unauthorized,
            GatewayError::InstanceUnavailable(_) => ProxyErrorCode::InstanceUnavailable,
            GatewayError::UpstreamUnreachable(_) => ProxyErrorCode::UpstreamUnreachable,
            GatewayError::SessionRejected => ProxyErrorCode::SessionRejected,
            GatewayError::RequestTimeout(_) => ProxyErrorCode::RequestTimeout,
            GatewayError::ConnectionFailed(_) => ProxyErrorCode::ConnectionFailed,
            GatewayError::Internal(_) => ProxyErrorCode::InternalError,
        }
    }

    /// Message safe to show to the caller; internal detail stays in the logs
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::MissingCredential => "Missing credential header".to_string(),
            GatewayError::Unauthorized => "Invalid credential".to_string(),
            GatewayError::InstanceUnavailable(_) => {
                "Instance unavailable, please retry".to_string()
            }
            GatewayError::UpstreamUnreachable(_) => {
                "Upstream service unreachable, please retry".to_string()
            }
            GatewayError::SessionRejected => "Backend rejected the session".to_string(),
            GatewayError::RequestTimeout(secs) => {
                format!("Request timed out after {} seconds", secs)
            }
            GatewayError::ConnectionFailed(_) => "Failed to connect to instance".to_string(),
            GatewayError::Internal(_) => "Internal error".to_string(),
        }
    }

    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.public_message())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value());
    if code.is_retryable() {
        builder = builder.header(hyper::header::RETRY_AFTER, RETRY_AFTER_SECS);
    }

    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
