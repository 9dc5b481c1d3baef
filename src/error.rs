//! Error types for the supervisor and JSON error responses for the router

use crate::upstream::ForwardError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Body of every response the router sends
pub type ProxyBody = BoxBody<Bytes, ForwardError>;

/// Errors raised while starting or supervising backend processes
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The backend executable could not be started
    #[error("failed to spawn backend '{name}' ({command}): {source}")]
    Spawn {
        name: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The launch command could not be built
    #[error("invalid command for backend '{name}': {reason}")]
    InvalidCommand { name: String, reason: String },

    /// The configured working directory does not exist
    #[error("working directory for backend '{name}' does not exist: {}", path.display())]
    MissingWorkingDir { name: String, path: PathBuf },

    /// A log file could not be created
    #[error("failed to open log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signal handlers could not be installed
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// `start_all` was called twice or after shutdown
    #[error("supervisor already started")]
    AlreadyStarted,
}

/// Error codes for router errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend is configured for the first path segment
    UnknownRoute,
    /// Failed to connect to or talk to the backend
    ConnectionFailed,
    /// Backend did not answer within the request timeout
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// The error code
    pub code: ProxyErrorCode,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: code.status_code().as_u16(),
            code,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":"{}","status":{}}}"#,
                self.error.replace('\\', "\\\\").replace('"', "\\\""),
                self.code.as_header_value(),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
