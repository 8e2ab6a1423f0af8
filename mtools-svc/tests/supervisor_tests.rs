//! Integration tests for supervised tool execution
//!
//! Uses coreutils programs as stand-in tools.

#![cfg(unix)]

use mtools_common::config::MemoryConfig;
use mtools_svc::error::GuardError;
use mtools_svc::services::{
    AdmissionGate, MemoryGovernor, PathGuard, ProcessSupervisor, StaticMemoryProbe, ToolCommand,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn governor(process_rss_mb: u64) -> MemoryGovernor {
    let probe = Arc::new(StaticMemoryProbe::new(64_000, 32_000, process_rss_mb));
    MemoryGovernor::new(probe, MemoryConfig::default())
}

fn supervisor(process_rss_mb: u64, max_output_bytes: usize) -> ProcessSupervisor {
    ProcessSupervisor::new(
        governor(process_rss_mb),
        Duration::from_millis(50),
        max_output_bytes,
    )
}

#[tokio::test]
async fn test_timeout_kills_tool_and_releases_slot() {
    let gate = AdmissionGate::new(1, governor(10));
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("sleep").choice("5");

    let started = Instant::now();
    let result = {
        let _slot = gate.acquire("separation", 100).unwrap();
        assert_eq!(gate.active(), 1);
        supervisor.run(&command, Duration::from_secs(1), 10_000).await
    };
    let elapsed = started.elapsed();

    match result {
        Err(GuardError::Timeout { after }) => assert_eq!(after, Duration::from_secs(1)),
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert_eq!(gate.active(), 0);
}

#[tokio::test]
async fn test_memory_ceiling_kills_tool() {
    let supervisor = supervisor(500, 4096);
    let command = ToolCommand::new("sleep").choice("5");

    let started = Instant::now();
    let result = supervisor.run(&command, Duration::from_secs(10), 100).await;

    match result {
        Err(GuardError::ResourceExceeded { peak_mb, ceiling_mb }) => {
            assert_eq!(peak_mb, 500);
            assert_eq!(ceiling_mb, 100);
        }
        other => panic!("Expected ResourceExceeded, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_non_zero_exit() {
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("false");

    let output = supervisor
        .run(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(1));
    assert!(!output.success());

    let err = supervisor
        .run_checked(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::ToolFailure { code: Some(1), .. }));
}

#[tokio::test]
async fn test_successful_run_captures_output() {
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("echo").choice("separated");

    let output = supervisor
        .run_checked(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "separated");
}

#[tokio::test]
async fn test_captured_output_is_bounded() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("big.raw"), vec![0u8; 200_000]).unwrap();
    let input = PathGuard::new([dir.path()]).unwrap().validate("big.raw", true).unwrap();

    let supervisor = supervisor(10, 1024);
    let command = ToolCommand::new("cat").path(input);

    let output = supervisor
        .run(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.len(), 1024);
}

#[tokio::test]
async fn test_metacharacters_never_reach_a_process() {
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("echo").choice("x; touch /tmp/pwned");

    let err = supervisor
        .run(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Security(_)));
}

#[tokio::test]
async fn test_unguarded_path_never_reaches_a_process() {
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("cat").choice("../../../../../../etc/hostname");

    let err = supervisor
        .run(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Security(_)));
}

#[tokio::test]
async fn test_missing_program_is_an_error() {
    let supervisor = supervisor(10, 4096);
    let command = ToolCommand::new("definitely-not-an-installed-tool");

    let err = supervisor
        .run(&command, Duration::from_secs(5), 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Io(_)));
}
