//! Test application state and request builders
//!
//! Storage lives under a fresh temp directory and memory readings come from
//! a [`StaticMemoryProbe`], so tests never depend on the host.

use axum::body::Body;
use axum::http::Request;
use mtools_common::TomlConfig;
use mtools_svc::services::{ExitCleanupRegistry, MemoryGovernor, StaticMemoryProbe};
use mtools_svc::AppState;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub const BOUNDARY: &str = "mtools-test-boundary";

/// Everything a test needs to drive the router and inspect the disk
pub struct TestApp {
    pub dir: TempDir,
    pub state: AppState,
    pub probe: Arc<StaticMemoryProbe>,
    pub registry: Arc<ExitCleanupRegistry>,
}

impl TestApp {
    pub fn upload_dir(&self) -> &Path {
        &self.state.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.state.output_guard.roots()[0]
    }

    pub fn temp_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("temp")
    }
}

/// Build state with default settings, adjusted by `configure`
pub fn test_app(configure: impl FnOnce(&mut TomlConfig)) -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut config = TomlConfig::default();
    config.storage.upload_dir = dir.path().join("uploads");
    config.storage.output_dir = dir.path().join("outputs");
    config.storage.temp_dir = dir.path().join("temp");
    configure(&mut config);
    config.validate().unwrap();

    let probe = Arc::new(StaticMemoryProbe::new(64_000, 32_000, 100));
    let governor = MemoryGovernor::new(probe.clone(), config.memory.clone());
    let registry = ExitCleanupRegistry::new();
    let state = AppState::new(config, governor, registry.clone()).unwrap();

    TestApp {
        dir,
        state,
        probe,
        registry,
    }
}

/// One part of a multipart body
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        filename: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

/// Encode `parts` as a multipart/form-data body
pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                filename,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                         Content-Type: {}\r\n\r\n",
                        filename, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// POST a multipart body to the separation endpoint
pub fn separate_request(parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/separate-stems")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

/// A minimal RIFF/WAVE header followed by `len` zero bytes
pub fn wav_bytes(len: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(len + 12);
    data.extend_from_slice(b"RIFF\x24\x00\x00\x00WAVE");
    data.resize(len + 12, 0);
    data
}

/// Number of entries directly under `dir`
pub fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
