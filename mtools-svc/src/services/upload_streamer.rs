//! Streaming upload staging
//!
//! Copies an inbound byte stream to a temp file one chunk at a time. At most
//! one chunk is held in memory, the running total is checked after every
//! chunk, and the temp file is removed on every failure path, including the
//! future being dropped mid-stream.

use crate::error::{GuardError, GuardResult};
use crate::services::content_sniffer::{self, SniffResult, SNIFF_PREFIX_LEN};
use crate::services::exit_cleanup::{ExitCleanupRegistry, ScopedPath};
use crate::services::upload_policy::DeclaredUpload;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// A fully received upload staged on disk
///
/// The temp file is removed when the session is dropped.
#[derive(Debug)]
pub struct UploadSession {
    declared_filename: String,
    declared_content_type: Option<String>,
    declared: Option<DeclaredUpload>,
    bytes_received: u64,
    sniff: SniffResult,
    temp_file: ScopedPath,
}

impl UploadSession {
    pub fn path(&self) -> &Path {
        self.temp_file.path()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn sniff(&self) -> &SniffResult {
        &self.sniff
    }

    pub fn declared_filename(&self) -> &str {
        &self.declared_filename
    }

    pub fn declared_content_type(&self) -> Option<&str> {
        self.declared_content_type.as_deref()
    }

    /// Whitelisted declared metadata, when the caller checked it
    pub fn declared(&self) -> Option<&DeclaredUpload> {
        self.declared.as_ref()
    }

    /// Verify sniffed content against the declared extension
    pub fn check_content(&self) -> GuardResult<()> {
        let ext = self
            .declared
            .as_ref()
            .map(|d| d.extension)
            .ok_or_else(|| GuardError::Validation("upload has no declared extension".to_string()))?;
        content_sniffer::check_declared(ext, &self.sniff)
    }
}

/// Streams uploads into a staging directory under a size ceiling
#[derive(Debug, Clone)]
pub struct UploadStreamer {
    max_bytes: u64,
    chunk_size: usize,
    registry: Option<Arc<ExitCleanupRegistry>>,
}

impl UploadStreamer {
    pub fn new(max_bytes: u64, chunk_size: usize, registry: Option<Arc<ExitCleanupRegistry>>) -> Self {
        Self {
            max_bytes,
            chunk_size: chunk_size.max(1),
            registry,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Stream `source` into a new temp file under `destination_dir`
    ///
    /// Fails with `PayloadTooLarge` as soon as the running total passes the
    /// ceiling, and with `Validation` for an empty payload. The returned
    /// session's file is synced and closed, sized exactly to the bytes read.
    pub async fn stream<R>(
        &self,
        source: R,
        destination_dir: &Path,
        declared: DeclaredUpload,
        declared_filename: &str,
    ) -> GuardResult<UploadSession>
    where
        R: AsyncRead + Unpin,
    {
        let suffix = format!(".{}", declared.extension);
        let content_type = declared.content_type.clone();
        let mut session = self
            .stream_with_suffix(source, destination_dir, &suffix)
            .await?;
        session.declared_filename = declared_filename.to_string();
        session.declared_content_type = content_type;
        session.declared = Some(declared);
        Ok(session)
    }

    /// Stream without declared metadata (suffix chosen by the caller)
    pub async fn stream_with_suffix<R>(
        &self,
        mut source: R,
        destination_dir: &Path,
        suffix: &str,
    ) -> GuardResult<UploadSession>
    where
        R: AsyncRead + Unpin,
    {
        let (std_file, temp_path) = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(suffix)
            .tempfile_in(destination_dir)?
            .into_parts();
        let path = temp_path.keep().map_err(|e| GuardError::Io(e.error))?;

        // From here on the guard owns the file: any early return or drop of
        // this future removes it.
        let temp_file = ScopedPath::new(path, self.registry.clone());
        let mut file = tokio::fs::File::from_std(std_file);

        let mut chunk = vec![0u8; self.chunk_size];
        let mut prefix = Vec::with_capacity(SNIFF_PREFIX_LEN);
        let mut total: u64 = 0;

        loop {
            let n = match source.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(received = total, "Upload stream failed: {}", e);
                    return Err(GuardError::Io(e));
                }
            };
            if n == 0 {
                break;
            }

            total += n as u64;
            if total > self.max_bytes {
                warn!(
                    received = total,
                    limit = self.max_bytes,
                    "Upload exceeds size limit, aborting stream"
                );
                return Err(GuardError::PayloadTooLarge {
                    limit: self.max_bytes,
                    received: total,
                });
            }

            if prefix.len() < SNIFF_PREFIX_LEN {
                let take = (SNIFF_PREFIX_LEN - prefix.len()).min(n);
                prefix.extend_from_slice(&chunk[..take]);
            }

            file.write_all(&chunk[..n]).await?;
        }

        if total == 0 {
            return Err(GuardError::Validation("File is empty".to_string()));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let sniff = content_sniffer::sniff(&prefix);
        debug!(
            bytes = total,
            format = %sniff.detected_format,
            "Upload staged"
        );
        info!(bytes = total, "Streamed upload to temporary file");

        Ok(UploadSession {
            declared_filename: String::new(),
            declared_content_type: None,
            declared: None,
            bytes_received: total,
            sniff,
            temp_file,
        })
    }
}
