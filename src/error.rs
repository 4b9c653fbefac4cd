use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::results::SCHEMA_VERSION;

// ─── Stable error codes ──────────────────────────────────────────

/// Every user-visible failure carries one of these codes. The set is
/// append-only: formatters and the MCP wrapper key off the strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // admission
    CapacityExceeded,
    PerIpExceeded,
    InvalidConfig,
    Unauthorized,
    RateLimited,
    // transport
    ConnectionRefused,
    Timeout,
    Reset,
    TlsError,
    // protocol
    MalformedRequest,
    IllegalTransition,
    NotFound,
    // session
    Cancelled,
    DeadlineExceeded,
    PeerClosedUnexpectedly,
    ServerUnavailable,
    NetworkError,
    // internal
    StorageError,
    Unknown,
}

/// Structured error envelope emitted on every failing API response and
/// by the JSON/NDJSON formatters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub schema_version: String,
    pub error: bool,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            error: true,
            code,
            message: message.into(),
        }
    }
}

// ─── Control-plane errors ────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidConfig(String),

    #[error("server is at its concurrent test capacity")]
    CapacityExceeded,

    #[error("too many active tests from this address")]
    PerIpExceeded,

    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("stream '{0}' not found")]
    NotFound(String),

    #[error("stream is already in a terminal state")]
    IllegalTransition,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
            Self::CapacityExceeded => ErrorCode::CapacityExceeded,
            Self::PerIpExceeded => ErrorCode::PerIpExceeded,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::IllegalTransition => ErrorCode::IllegalTransition,
            Self::MalformedRequest(_) => ErrorCode::MalformedRequest,
            Self::Storage(_) => ErrorCode::StorageError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidConfig(_) | Self::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::IllegalTransition => StatusCode::CONFLICT,
            Self::RateLimited { .. } | Self::CapacityExceeded | Self::PerIpExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::new(self.code(), self.to_string());
        let mut response = (self.status(), Json(envelope)).into_response();

        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

// ─── Data-plane errors ───────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("dial to {0} timed out")]
    DialTimeout(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered status {0}")]
    HttpStatus(u16),

    #[error("test cancelled")]
    Cancelled,

    #[error("peer closed the connection unexpectedly")]
    PeerClosed,
}

impl EngineError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Map onto the stable code set per the wire contract: explicit
    /// cancellation → cancelled, deadline → timeout, dial failure →
    /// connection_refused, DNS miss / 503 → server_unavailable,
    /// 429 → rate_limited, anything else → network_error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cancelled => ErrorCode::Cancelled,
            Self::DialTimeout(_) => ErrorCode::Timeout,
            Self::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            Self::PeerClosed => ErrorCode::PeerClosedUnexpectedly,
            Self::HttpStatus(429) => ErrorCode::RateLimited,
            Self::HttpStatus(503) => ErrorCode::ServerUnavailable,
            Self::HttpStatus(_) => ErrorCode::NetworkError,
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset => ErrorCode::Reset,
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ErrorCode::Timeout,
                _ => ErrorCode::NetworkError,
            },
            Self::Http(err) => {
                if err.is_timeout() {
                    ErrorCode::Timeout
                } else if err.is_connect() {
                    // reqwest folds DNS failures into connect errors;
                    // no-such-host surfaces in the message.
                    if err.to_string().contains("dns") {
                        ErrorCode::ServerUnavailable
                    } else {
                        ErrorCode::ConnectionRefused
                    }
                } else if let Some(status) = err.status() {
                    match status.as_u16() {
                        429 => ErrorCode::RateLimited,
                        503 => ErrorCode::ServerUnavailable,
                        _ => ErrorCode::NetworkError,
                    }
                } else {
                    ErrorCode::Unknown
                }
            }
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ─── Tests ───────────────────────────────────────────────────────
