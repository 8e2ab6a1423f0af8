//! Declared upload metadata checks
//!
//! Filename extension and declared content-type are checked against fixed
//! whitelists. They are never trusted on their own: the content sniffer
//! still has the final say.

use crate::error::{GuardError, GuardResult};
use std::path::Path;

/// Accepted upload extensions (lowercase, no dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "aac", "ogg", "opus", "wma"];

/// Accepted declared content-types
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "audio/mpeg",
    "audio/mp3",
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/flac",
    "audio/x-flac",
    "audio/mp4",
    "audio/x-m4a",
    "audio/aac",
    "audio/ogg",
    "audio/opus",
    "audio/x-ms-wma",
    "application/octet-stream",
];

/// Upload metadata after the declared-value checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredUpload {
    /// Extension from the whitelist (lowercase, no dot)
    pub extension: &'static str,
    /// Filename stem, kept only for naming outputs
    pub base_name: String,
    pub content_type: Option<String>,
}

/// Validate the declared filename and content-type of an upload
pub fn check_declared_upload(
    filename: Option<&str>,
    content_type: Option<&str>,
) -> GuardResult<DeclaredUpload> {
    let filename = filename
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| GuardError::Validation("No file provided or filename missing".to_string()))?;

    let path = Path::new(filename);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| GuardError::Validation("File must have a valid extension".to_string()))?;

    let extension = ALLOWED_EXTENSIONS
        .iter()
        .copied()
        .find(|allowed| *allowed == ext)
        .ok_or_else(|| {
            GuardError::Validation(format!(
                "Unsupported file extension '.{}'. Allowed: {}",
                ext,
                ALLOWED_EXTENSIONS.join(", ")
            ))
        })?;

    let content_type = match content_type.map(str::trim).filter(|c| !c.is_empty()) {
        Some(declared) => {
            // Drop parameters such as `; charset=binary`
            let essence = declared
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if !ALLOWED_MIME_TYPES.contains(&essence.as_str()) {
                return Err(GuardError::Validation(format!(
                    "Unsupported file type '{}'. Allowed audio files only.",
                    essence
                )));
            }
            Some(essence)
        }
        None => None,
    };

    Ok(DeclaredUpload {
        extension,
        base_name: output_base_name(path),
        content_type,
    })
}

/// Filesystem-safe stem used to name outputs
///
/// Keeps alphanumerics and a small set of punctuation; everything else is
/// dropped. Falls back to "audio" if nothing survives.
fn output_base_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .take(120)
        .collect();
    let cleaned = cleaned.trim().trim_start_matches(['-', ' ']);
    if cleaned.is_empty() {
        "audio".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Content-type to serve a stored file with
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "wma" => "audio/x-ms-wma",
        _ => "application/octet-stream",
    }
}
