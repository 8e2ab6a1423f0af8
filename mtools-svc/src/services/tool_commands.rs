//! Closed tool configurations
//!
//! Each external tool gets a fixed argv shape. The only request-derived
//! values that reach an argv are members of the closed sets below, paths
//! that passed the path guard, and a parsed [`VideoSource`].

use crate::error::{GuardError, GuardResult};
use crate::services::path_guard::{validate_enum, ValidatedPath};
use crate::services::process_supervisor::ToolCommand;
use serde::Serialize;
use std::fmt;
use url::Url;

macro_rules! closed_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
            pub const NAMES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            /// Whitelist-parse an untrusted value
            pub fn parse(value: &str) -> GuardResult<Self> {
                let name = validate_enum(value, Self::NAMES)?;
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == name)
                    .ok_or_else(|| GuardError::Internal(format!("unmapped {} value", stringify!($name))))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

closed_enum! {
    /// Separation models the tool is allowed to load
    SeparationModel {
        Htdemucs => "htdemucs",
        HtdemucsFt => "htdemucs_ft",
        MdxExtra => "mdx_extra",
        MdxExtraQ => "mdx_extra_q",
    }
}

closed_enum! {
    /// Output formats for separated stems
    StemFormat {
        Wav => "wav",
        Mp3 => "mp3",
        Flac => "flac",
    }
}

closed_enum! {
    /// Stems produced by the separation tool
    StemName {
        Vocals => "vocals",
        Drums => "drums",
        Bass => "bass",
        Other => "other",
    }
}

closed_enum! {
    /// Audio formats the downloader may extract to
    DownloadFormat {
        Mp3 => "mp3",
        M4a => "m4a",
        Wav => "wav",
        Flac => "flac",
        Aac => "aac",
        Opus => "opus",
    }
}

impl Default for SeparationModel {
    fn default() -> Self {
        SeparationModel::Htdemucs
    }
}

impl Default for StemFormat {
    fn default() -> Self {
        StemFormat::Mp3
    }
}

impl Default for DownloadFormat {
    fn default() -> Self {
        DownloadFormat::Mp3
    }
}

/// Downloader audio quality, 0 (best) to 10 (smallest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AudioQuality(u8);

impl AudioQuality {
    pub const BEST: AudioQuality = AudioQuality(0);
    pub const WORST: AudioQuality = AudioQuality(10);

    pub fn new(value: i64) -> GuardResult<Self> {
        u8::try_from(value)
            .ok()
            .filter(|q| *q <= Self::WORST.0)
            .map(AudioQuality)
            .ok_or_else(|| {
                GuardError::Validation("audio_quality must be between 0 and 10".to_string())
            })
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Argument form of the quality level
    pub fn as_str(&self) -> &'static str {
        const LEVELS: [&str; 11] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "10"];
        LEVELS[usize::from(self.0.min(Self::WORST.0))]
    }
}

impl Default for AudioQuality {
    fn default() -> Self {
        AudioQuality::BEST
    }
}

/// Hosts a download URL may point at
pub const DOWNLOAD_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "youtu.be",
    "music.youtube.com",
];

const VIDEO_ID_LEN: usize = 11;

/// A download source reduced to its video id
///
/// Only the id survives parsing; the argv carries a URL rebuilt from it, so
/// query strings and fragments from the request never reach the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    video_id: String,
}

impl VideoSource {
    pub fn parse(raw: &str) -> GuardResult<Self> {
        let invalid = |why: &str| GuardError::Validation(format!("Invalid YouTube URL: {}", why));

        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(invalid("malformed"));
        }

        let url = Url::parse(raw).map_err(|_| invalid("malformed"))?;
        if url.scheme() != "https" {
            return Err(invalid("https required"));
        }
        if !url.username().is_empty() || url.password().is_some() || url.port().is_some() {
            return Err(invalid("credentials or port not allowed"));
        }
        let host = url
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| invalid("missing host"))?;
        if !DOWNLOAD_HOSTS.contains(&host.as_str()) {
            return Err(invalid("host not allowed"));
        }

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        let candidate = if host == "youtu.be" {
            segments.first().map(|s| s.to_string())
        } else {
            match segments.as_slice() {
                ["watch"] => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                ["shorts" | "embed" | "live", id, ..] => Some(id.to_string()),
                _ => None,
            }
        };

        let video_id = candidate.ok_or_else(|| invalid("no video id"))?;
        if video_id.len() != VIDEO_ID_LEN
            || !video_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("bad video id"));
        }

        Ok(Self { video_id })
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    /// Canonical URL handed to the downloader
    pub fn canonical_url(&self) -> String {
        format!("https://youtu.be/{}", self.video_id)
    }
}

/// `<python> -m demucs.separate -n <model> -o <output_dir> <input>`
pub fn separation_command(
    python: &str,
    model: SeparationModel,
    output_dir: ValidatedPath,
    input: ValidatedPath,
) -> ToolCommand {
    ToolCommand::new(python)
        .flag("-m")
        .flag("demucs.separate")
        .flag("-n")
        .choice(model.as_str())
        .flag("-o")
        .path(output_dir)
        .path(input)
}

/// Transcode a WAV stem into `format`
///
/// Returns `None` for WAV, which needs a plain copy instead.
pub fn transcode_command(
    ffmpeg: &str,
    input: ValidatedPath,
    format: StemFormat,
    output: ValidatedPath,
) -> Option<ToolCommand> {
    let base = ToolCommand::new(ffmpeg)
        .flag("-hide_banner")
        .flag("-loglevel")
        .flag("error")
        .flag("-nostdin")
        .flag("-y")
        .flag("-i")
        .path(input);

    let cmd = match format {
        StemFormat::Wav => return None,
        StemFormat::Mp3 => base
            .flag("-codec:a")
            .flag("libmp3lame")
            .flag("-b:a")
            .flag("192k"),
        StemFormat::Flac => base.flag("-codec:a").flag("flac"),
    };
    Some(cmd.path(output))
}

/// Extract the audio of one video to `output_stem.<format>`
///
/// The downloader appends the extension itself.
pub fn download_command(
    downloader: &str,
    source: &VideoSource,
    format: DownloadFormat,
    quality: AudioQuality,
    output_stem: ValidatedPath,
) -> ToolCommand {
    ToolCommand::new(downloader)
        .flag("--no-playlist")
        .flag("--no-progress")
        .flag("--no-exec")
        .flag("-f")
        .flag("bestaudio/best")
        .flag("-x")
        .flag("--audio-format")
        .choice(format.as_str())
        .flag("--audio-quality")
        .choice(quality.as_str())
        .flag("-o")
        .path(output_stem)
        .flag("--")
        .video(source)
}
