//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **AppError**: failures of the HTTP surface (config endpoint, bad requests).
//!   These are converted into JSON responses through Actix's `ResponseError`.
//! - **CallError**: failures of a live voice call. Only a few of them end a
//!   call; the rest are recovered locally by skipping one unit of work
//!   (one audio chunk, one outbound frame).
//!
//! ## Fatal vs recoverable:
//! - `PermissionDenied`, `DeviceUnavailable` and `Connect` end the call attempt
//! - `MalformedFrame` drops one inbound chunk, playback continues
//! - `TransportClosed` drops one outbound frame during teardown

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by the HTTP handlers.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// The server is at capacity (e.g. the concurrent call limit)
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Maps each error to a status code and a JSON body:
///
/// ```json
/// { "error": { "type": "validation_error", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Config validation returns `anyhow` errors, so a failed update surfaces
/// as a validation problem rather than a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised while setting up or running a live voice call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Microphone access was refused by the user or the host.
    PermissionDenied(String),

    /// The microphone or playback device could not be opened.
    DeviceUnavailable(String),

    /// The speech service connection could not be opened.
    Connect(String),

    /// An audio payload could not be decoded.
    MalformedFrame(String),

    /// Audio was sent after the transport closed.
    TransportClosed,

    /// The outbound queue is full because the socket writer fell behind.
    OutboundFull,

    /// The operation is not valid in the current call phase.
    InvalidState(String),

    /// The call was ended while it was still connecting.
    Cancelled,
}

impl CallError {
    /// Whether this error ends the call attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::PermissionDenied(_) | CallError::DeviceUnavailable(_) | CallError::Connect(_)
        )
    }

    /// Machine-readable code used in WebSocket error messages.
    pub fn code(&self) -> &'static str {
        match self {
            CallError::PermissionDenied(_) => "permission_denied",
            CallError::DeviceUnavailable(_) => "device_unavailable",
            CallError::Connect(_) => "connect_error",
            CallError::MalformedFrame(_) => "malformed_frame",
            CallError::TransportClosed => "transport_closed",
            CallError::OutboundFull => "outbound_full",
            CallError::InvalidState(_) => "invalid_state",
            CallError::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            CallError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            CallError::Connect(msg) => write!(f, "Failed to connect to speech service: {}", msg),
            CallError::MalformedFrame(msg) => write!(f, "Malformed audio frame: {}", msg),
            CallError::TransportClosed => write!(f, "Transport closed during send"),
            CallError::OutboundFull => write!(f, "Outbound audio queue full"),
            CallError::InvalidState(msg) => write!(f, "Invalid call state: {}", msg),
            CallError::Cancelled => write!(f, "Call ended while connecting"),
        }
    }
}

impl std::error::Error for CallError {}
