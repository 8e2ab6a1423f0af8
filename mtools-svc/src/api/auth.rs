//! API-key access control
//!
//! When `[auth] require_api_key` is set, every `/api/v1` request must carry
//! one of the configured keys in `X-API-Key`. `/health` stays public.

use axum::{
    extract::{Request, State},
    http::header::USER_AGENT,
    middleware::Next,
    response::Response,
};

use crate::error::ApiError;
use crate::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Reject requests without a valid API key before any body is read
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = &state.config.auth;
    if !auth.require_api_key {
        return Ok(next.run(request).await);
    }

    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let path = request.uri().path();

    let Some(presented) = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        tracing::warn!(
            target: "security",
            path,
            user_agent,
            "API key required but none provided"
        );
        return Err(ApiError::Unauthorized(
            "API key required. Provide X-API-Key header.".to_string(),
        ));
    };

    let valid = auth
        .api_keys
        .iter()
        .filter(|k| !k.is_empty())
        .any(|k| ct_eq(k.as_bytes(), presented.as_bytes()));
    if !valid {
        tracing::warn!(target: "security", path, user_agent, "Invalid API key attempted");
        return Err(ApiError::Unauthorized("Invalid API key".to_string()));
    }

    tracing::debug!(path, "API key authenticated");
    Ok(next.run(request).await)
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(b"secret-key", b"secret-key"));
        assert!(!ct_eq(b"secret-key", b"secret-kez"));
        assert!(!ct_eq(b"secret", b"secret-key"));
    }
}
