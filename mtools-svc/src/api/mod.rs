//! HTTP API handlers for mtools-svc
//!
//! Handlers only decode requests and encode responses. Every value they
//! pass on is validated by the services layer.

pub mod auth;
pub mod downloads;
pub mod health;
pub mod stems;
pub mod storage;
pub mod youtube;

pub use auth::auth_middleware;
pub use downloads::download_routes;
pub use health::health_routes;
pub use stems::stem_routes;
pub use storage::storage_routes;
pub use youtube::youtube_routes;

use crate::error::GuardError;

/// Log a rejected request input, then pass the error on
pub(crate) fn rejected(context: &'static str) -> impl Fn(GuardError) -> GuardError {
    move |err| {
        err.log_rejection(context);
        err
    }
}

/// Percent-encode everything outside the unreserved set
pub(crate) fn encode_path_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
