//! Audio extraction with a stand-in downloader
//!
//! The script receives the downloader argv and writes `<stem>.<format>`,
//! plus a side file the job must ignore.

#![cfg(unix)]

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use helpers::test_app::{entry_count, test_app, TestApp};
use http_body_util::BodyExt;
use mtools_svc::build_router;
use serde_json::{json, Value};
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tower::ServiceExt;

// $8 = audio format, $10 = quality, $12 = output stem, $14 = url
const DOWNLOADS: &str = r#"#!/bin/sh
[ "${14}" = "https://youtu.be/dQw4w9WgXcQ" ] || { echo "unexpected url ${14}" >&2; exit 2; }
[ "${10}" = "5" ] || { echo "unexpected quality" >&2; exit 2; }
printf 'ID3\003\000\000\000\000\000\000' > "${12}.$8"
printf 'x' > "${12}.webm.part"
"#;

const REFUSES: &str = r#"#!/bin/sh
echo "ERROR: [youtube] dQw4w9WgXcQ: Video unavailable" >&2
exit 1
"#;

fn app_with_downloader(script: &str) -> (tempfile::TempDir, TestApp) {
    let tools = tempfile::TempDir::new().unwrap();
    let program = tools.path().join("fake-downloader.sh");
    std::fs::write(&program, script).unwrap();
    let mut perms = std::fs::metadata(&program).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&program, perms).unwrap();

    let app = test_app(|config| {
        config.tools.downloader_program = program.to_string_lossy().into_owned();
        config.tools.download_timeout_secs = 5;
    });
    (tools, app)
}

fn extract_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/v1/youtube-to-mp3")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn job_dirs(output_dir: &Path) -> Vec<String> {
    std::fs::read_dir(output_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
#[serial]
async fn test_extraction_produces_downloadable_file() {
    let (_tools, app) = app_with_downloader(DOWNLOADS);
    let router = build_router(app.state.clone());

    let request = extract_request(json!({
        "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123&index=2",
        "audio_quality": 5,
        "audio_format": "mp3",
    }));
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    assert_eq!(json["success"], true);
    let file_id = json["file_id"].as_str().unwrap();
    assert_eq!(json["filename"], format!("audio_{}.mp3", file_id));
    assert_eq!(job_dirs(app.output_dir()), vec![file_id.to_string()]);
    assert_eq!(entry_count(&app.temp_dir()), 0);
    assert_eq!(app.state.gate.active(), 0);

    let download = Request::builder()
        .uri(json["download_url"].as_str().unwrap())
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(download).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/mpeg");
}

#[tokio::test]
#[serial]
async fn test_downloader_failure_leaves_nothing_behind() {
    let (_tools, app) = app_with_downloader(REFUSES);
    let router = build_router(app.state.clone());

    let request = extract_request(json!({ "url": "https://youtu.be/dQw4w9WgXcQ" }));
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let json = json_body(response).await;
    assert_eq!(json["error"]["reason"], "tool_failure");
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Video unavailable"));
    assert_eq!(entry_count(app.output_dir()), 0);
    assert_eq!(entry_count(&app.temp_dir()), 0);
    assert!(app.registry.is_empty());
}

#[tokio::test]
async fn test_rejects_foreign_and_malformed_urls() {
    let app = test_app(|_| {});
    let router = build_router(app.state.clone());

    for url in [
        "https://evil.example/watch?v=dQw4w9WgXcQ",
        "http://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "https://www.youtube.com/watch?v=$(reboot)",
        "https://youtu.be/dQw4w9WgXcQ --exec rm",
    ] {
        let response = router
            .clone()
            .oneshot(extract_request(json!({ "url": url })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", url);
    }
    assert_eq!(entry_count(&app.temp_dir()), 0);
}

#[tokio::test]
async fn test_rejects_bad_options_and_bodies() {
    let app = test_app(|_| {});
    let router = build_router(app.state.clone());

    for body in [
        json!({ "url": "https://youtu.be/dQw4w9WgXcQ", "audio_quality": 42 }),
        json!({ "url": "https://youtu.be/dQw4w9WgXcQ", "audio_format": "exe" }),
        json!({ "audio_format": "mp3" }),
    ] {
        let response = router
            .clone()
            .oneshot(extract_request(body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        let json = json_body(response).await;
        assert_eq!(json["error"]["code"], "bad_input");
    }
}
