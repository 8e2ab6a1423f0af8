//! Audio content sniffing
//!
//! Identifies the audio container from the first bytes of an upload,
//! independent of the declared filename or content-type.

use crate::error::{GuardError, GuardResult};
use serde::Serialize;
use std::fmt;

/// Number of leading bytes inspected
pub const SNIFF_PREFIX_LEN: usize = 32;

/// Container formats the sniffer recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Flac,
    Ogg,
    Mp4,
    Wma,
    Unknown,
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Mp3 => "MP3",
            AudioFormat::Wav => "WAV",
            AudioFormat::Flac => "FLAC",
            AudioFormat::Ogg => "OGG",
            AudioFormat::Mp4 => "M4A/MP4",
            AudioFormat::Wma => "WMA",
            AudioFormat::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl AudioFormat {
    /// Declared extensions (lowercase, no dot) compatible with this container
    pub fn compatible_extensions(&self) -> &'static [&'static str] {
        match self {
            AudioFormat::Mp3 => &["mp3"],
            AudioFormat::Wav => &["wav"],
            AudioFormat::Flac => &["flac"],
            AudioFormat::Ogg => &["ogg", "opus"],
            // Raw AAC in an MP4 container is commonly uploaded as .aac
            AudioFormat::Mp4 => &["m4a", "aac", "mp4"],
            AudioFormat::Wma => &["wma"],
            AudioFormat::Unknown => &[],
        }
    }
}

/// Outcome of sniffing one upload prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SniffResult {
    pub is_audio: bool,
    pub detected_format: AudioFormat,
}

impl SniffResult {
    fn detected(format: AudioFormat) -> Self {
        Self {
            is_audio: format != AudioFormat::Unknown,
            detected_format: format,
        }
    }

    pub fn unknown() -> Self {
        Self::detected(AudioFormat::Unknown)
    }
}

/// Classify a byte prefix
///
/// Only the first [`SNIFF_PREFIX_LEN`] bytes are considered. Fewer than four
/// bytes can never be classified.
pub fn sniff(prefix_bytes: &[u8]) -> SniffResult {
    let header = &prefix_bytes[..prefix_bytes.len().min(SNIFF_PREFIX_LEN)];
    if header.len() < 4 {
        return SniffResult::unknown();
    }

    let format = match header {
        // MPEG audio frame sync (MPEG-1 layer III, MPEG-2 layer III variants)
        [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] | [0xFF, 0xF2, ..] => AudioFormat::Mp3,
        // Legacy ID3v2 tag in front of MP3 frames
        [b'I', b'D', b'3', ..] => AudioFormat::Mp3,
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => AudioFormat::Wav,
        [b'f', b'L', b'a', b'C', ..] => AudioFormat::Flac,
        [b'O', b'g', b'g', b'S', ..] => AudioFormat::Ogg,
        // ASF header object GUID
        [0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11, ..] => AudioFormat::Wma,
        // ISO base media: 4-byte box size, then the `ftyp` box type
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => AudioFormat::Mp4,
        _ => AudioFormat::Unknown,
    };

    SniffResult::detected(format)
}

/// Reconcile a sniff result with the client's declared extension
///
/// Unknown content is fatal, and so is content that contradicts the
/// declared extension.
pub fn check_declared(declared_ext: &str, result: &SniffResult) -> GuardResult<()> {
    if !result.is_audio {
        return Err(GuardError::Validation(
            "File does not appear to be a valid audio file. \
             Please upload MP3, WAV, FLAC, M4A, or other supported audio formats."
                .to_string(),
        ));
    }

    let ext = declared_ext.trim_start_matches('.').to_ascii_lowercase();
    if !result
        .detected_format
        .compatible_extensions()
        .contains(&ext.as_str())
    {
        return Err(GuardError::Validation(format!(
            "File content ({}) does not match its extension (.{})",
            result.detected_format, ext
        )));
    }

    Ok(())
}
