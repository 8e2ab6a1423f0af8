//! Stem separation form fields
//!
//! Multipart text fields arrive as raw strings. They are collected here and
//! turned into a closed [`StemRequest`] in one place, so handlers never see
//! an unvalidated value.

use crate::error::{GuardError, GuardResult};
use crate::services::audio_extract::ExtractRequest;
use crate::services::stem_job::StemRequest;
use crate::services::tool_commands::{
    AudioQuality, DownloadFormat, SeparationModel, StemFormat, StemName, VideoSource,
};
use serde::Deserialize;

/// Raw text fields of a stem separation upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StemForm {
    pub model: Option<String>,
    pub output_format: Option<String>,
    /// Comma-separated stem names; blank means all
    pub stems: Option<String>,
}

impl StemForm {
    /// Longest text field value accepted
    pub const MAX_FIELD_LEN: usize = 256;

    /// Record one text field; unknown names are rejected
    pub fn set(&mut self, name: &str, value: String) -> GuardResult<()> {
        if value.len() > Self::MAX_FIELD_LEN {
            return Err(GuardError::Validation(format!("field '{}' too long", name)));
        }
        let slot = match name {
            "model" => &mut self.model,
            "output_format" => &mut self.output_format,
            "stems" => &mut self.stems,
            _ => return Err(GuardError::Validation(format!("unexpected field '{}'", name))),
        };
        *slot = Some(value);
        Ok(())
    }

    /// Whitelist every field; absent fields take their defaults
    pub fn into_request(self) -> GuardResult<StemRequest> {
        let model = match self.model.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => SeparationModel::parse(value)?,
            None => SeparationModel::default(),
        };
        let format = match self
            .output_format
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            Some(value) => StemFormat::parse(value)?,
            None => StemFormat::default(),
        };

        let mut stems = Vec::new();
        if let Some(list) = self.stems.as_deref() {
            for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let stem = StemName::parse(item).map_err(|_| {
                    GuardError::Validation(format!(
                        "Invalid stem. Valid stems: {}",
                        StemName::NAMES.join(", ")
                    ))
                })?;
                if !stems.contains(&stem) {
                    stems.push(stem);
                }
            }
        }

        Ok(StemRequest {
            model,
            format,
            stems,
        })
    }
}

/// JSON body of an audio extraction request
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExtractForm {
    pub url: String,
    /// 0 (best) to 10 (smallest)
    #[serde(default)]
    pub audio_quality: Option<i64>,
    #[serde(default)]
    pub audio_format: Option<String>,
}

impl ExtractForm {
    pub fn into_request(self) -> GuardResult<ExtractRequest> {
        if self.url.len() > StemForm::MAX_FIELD_LEN {
            return Err(GuardError::Validation("url too long".to_string()));
        }
        let source = VideoSource::parse(&self.url)?;
        let quality = match self.audio_quality {
            Some(value) => AudioQuality::new(value)?,
            None => AudioQuality::default(),
        };
        let format = match self.audio_format.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => DownloadFormat::parse(value)?,
            None => DownloadFormat::default(),
        };
        Ok(ExtractRequest {
            source,
            format,
            quality,
        })
    }
}
