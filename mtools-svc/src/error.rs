//! Error types for mtools-svc
//!
//! `GuardError` is the failure taxonomy of the governance core. `ApiError`
//! maps it onto a small, stable set of client-visible outcomes without
//! leaking paths, command lines or tool output.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why an admission request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// All heavy-operation slots are taken
    ConcurrencyLimit,
    /// Not enough system or process memory headroom
    MemoryLimit,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::ConcurrencyLimit => write!(f, "concurrency limit reached"),
            DenyReason::MemoryLimit => write!(f, "insufficient memory"),
        }
    }
}

/// Governance core failures
#[derive(Debug, Error)]
pub enum GuardError {
    /// Malformed identifier, enum value or upload metadata
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Path escapes, traversal markers, disallowed argument characters
    #[error("Security violation: {0}")]
    Security(String),

    /// Streaming ceiling breached
    #[error("Payload too large: received more than {limit} bytes")]
    PayloadTooLarge { limit: u64, received: u64 },

    /// No slot or memory headroom available
    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: DenyReason },

    /// Subprocess exceeded its wall-clock budget and was killed
    #[error("Timed out after {}s", after.as_secs_f64())]
    Timeout { after: Duration },

    /// Subprocess exceeded its memory ceiling and was killed
    #[error("Resource exceeded: {peak_mb}MB > {ceiling_mb}MB")]
    ResourceExceeded { peak_mb: u64, ceiling_mb: u64 },

    /// Subprocess ran to completion with a non-zero exit
    #[error("Tool failed (exit {code:?}): {detail}")]
    ToolFailure { code: Option<i32>, detail: String },

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for the governance core
pub type GuardResult<T> = Result<T, GuardError>;

/// Outcome categories exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCategory {
    BadInput,
    TooLarge,
    Overloaded,
    TimedOut,
    ToolFailed,
    Internal,
}

impl GuardError {
    pub fn category(&self) -> OutcomeCategory {
        match self {
            GuardError::Validation(_) | GuardError::Security(_) => OutcomeCategory::BadInput,
            GuardError::PayloadTooLarge { .. } => OutcomeCategory::TooLarge,
            GuardError::AdmissionDenied { .. } => OutcomeCategory::Overloaded,
            GuardError::Timeout { .. } => OutcomeCategory::TimedOut,
            GuardError::ResourceExceeded { .. } | GuardError::ToolFailure { .. } => {
                OutcomeCategory::ToolFailed
            }
            GuardError::Io(_) | GuardError::Internal(_) => OutcomeCategory::Internal,
        }
    }

    /// Whether a caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GuardError::AdmissionDenied { .. }
                | GuardError::Timeout { .. }
                | GuardError::ResourceExceeded { .. }
        )
    }

    /// Stable reason tag for logs and responses
    pub fn reason_tag(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "validation",
            GuardError::Security(_) => "security",
            GuardError::PayloadTooLarge { .. } => "payload_too_large",
            GuardError::AdmissionDenied { reason: DenyReason::ConcurrencyLimit } => {
                "concurrency_limit"
            }
            GuardError::AdmissionDenied { reason: DenyReason::MemoryLimit } => "memory_limit",
            GuardError::Timeout { .. } => "timeout",
            GuardError::ResourceExceeded { .. } => "resource_exceeded",
            GuardError::ToolFailure { .. } => "tool_failure",
            GuardError::Io(_) => "io",
            GuardError::Internal(_) => "internal",
        }
    }

    /// Log a rejection of untrusted input
    ///
    /// Security violations go to the `security` target at warn so they can be
    /// routed separately from ordinary validation noise.
    pub fn log_rejection(&self, context: &str) {
        match self {
            GuardError::Security(msg) => {
                tracing::warn!(target: "security", context, reason = %msg, "Rejected unsafe input");
            }
            GuardError::Validation(msg) => {
                tracing::info!(context, reason = %msg, "Rejected invalid input");
            }
            _ => {}
        }
    }

    /// Message safe to return to a client
    fn public_message(&self) -> String {
        match self {
            GuardError::Validation(msg) => msg.clone(),
            GuardError::Security(_) => "Request rejected: invalid path or parameter".to_string(),
            GuardError::PayloadTooLarge { limit, .. } => format!(
                "File too large. Maximum size: {}MB",
                limit / (1024 * 1024)
            ),
            GuardError::AdmissionDenied { reason } => {
                format!("Server busy ({}), retry later", reason)
            }
            GuardError::Timeout { after } => {
                format!("Processing timed out after {}s", after.as_secs())
            }
            GuardError::ResourceExceeded { .. } => {
                "Processing aborted: memory limit exceeded".to_string()
            }
            GuardError::ToolFailure { detail, .. } => format!("Processing failed: {}", detail),
            GuardError::Io(_) | GuardError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing or invalid API key (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Governance core failure
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message, retryable) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, false),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_input", msg, false),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, false),
            ApiError::Guard(ref err) => {
                let status = match err.category() {
                    OutcomeCategory::BadInput => StatusCode::BAD_REQUEST,
                    OutcomeCategory::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                    OutcomeCategory::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
                    OutcomeCategory::TimedOut => StatusCode::GATEWAY_TIMEOUT,
                    OutcomeCategory::ToolFailed => StatusCode::UNPROCESSABLE_ENTITY,
                    OutcomeCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!("Request failed: {}", err);
                }
                let code = serde_json::to_value(err.category())
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "internal".to_string());
                return error_body(status, &code, err.public_message(), err.is_retryable(), Some(err.reason_tag()));
            }
            ApiError::Io(ref err) => {
                tracing::error!("Request failed with IO error: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error".to_string(),
                    false,
                )
            }
        };

        error_body(status, error_code, message, retryable, None)
    }
}

fn error_body(
    status: StatusCode,
    code: &str,
    message: String,
    retryable: bool,
    reason: Option<&str>,
) -> Response {
    let body = Json(json!({
        "error": {
            "code": code,
            "message": message,
            "retryable": retryable,
            "reason": reason,
        }
    }));
    (status, body).into_response()
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
