//! Supervised external tool execution
//!
//! Tools are launched directly (never through a shell) from a [`ToolCommand`]
//! whose arguments can only be fixed flag tokens, static enum values,
//! validated paths or a parsed video source. Every run ends in exactly one of: a normal exit, a kill
//! for exceeding the wall-clock budget, or a kill for exceeding the memory
//! ceiling.

use crate::error::{GuardError, GuardResult};
use crate::services::memory_governor::MemoryGovernor;
use crate::services::path_guard::ValidatedPath;
use crate::services::tool_commands::VideoSource;
use std::ffi::OsString;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Characters never allowed in a rendered argument
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '*', '?', '!', '\n', '\r', '\0',
    '\'', '"',
];

/// Tail of stderr carried in a `ToolFailure`
const FAILURE_DETAIL_CHARS: usize = 512;

/// How long to wait for output pipes to close after the child exits
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// One argument of a tool invocation
#[derive(Debug, Clone)]
pub enum SafeArg {
    /// Fixed token written into the program source
    Flag(&'static str),
    /// Value taken from a closed set compiled into the program
    Choice(&'static str),
    /// Path that passed the path guard
    Path(ValidatedPath),
    /// Download source, rendered as its canonical URL
    Video(VideoSource),
}

impl SafeArg {
    fn render(&self) -> GuardResult<String> {
        let (value, is_flag) = match self {
            SafeArg::Flag(flag) => ((*flag).to_string(), true),
            SafeArg::Choice(choice) => {
                if choice.contains('/') || choice.contains("..") {
                    return Err(GuardError::Security(format!(
                        "choice {:?} looks like an unvalidated path",
                        choice
                    )));
                }
                ((*choice).to_string(), false)
            }
            SafeArg::Video(source) => (source.canonical_url(), false),
            SafeArg::Path(path) => {
                let rendered = path.as_path().to_str().ok_or_else(|| {
                    GuardError::Security("path argument is not valid UTF-8".to_string())
                })?;
                (rendered.to_string(), false)
            }
        };

        if value.is_empty() {
            return Err(GuardError::Security("empty argument".to_string()));
        }
        if let Some(c) = value.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            return Err(GuardError::Security(format!(
                "argument contains disallowed character {:?}",
                c
            )));
        }
        if !is_flag && value.starts_with('-') {
            return Err(GuardError::Security(
                "argument value may not start with '-'".to_string(),
            ));
        }
        Ok(value)
    }
}

/// A program plus its safe arguments
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<SafeArg>,
}

impl ToolCommand {
    /// `program` comes from trusted configuration, never from a request
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn flag(mut self, flag: &'static str) -> Self {
        self.args.push(SafeArg::Flag(flag));
        self
    }

    pub fn choice(mut self, value: &'static str) -> Self {
        self.args.push(SafeArg::Choice(value));
        self
    }

    pub fn path(mut self, path: ValidatedPath) -> Self {
        self.args.push(SafeArg::Path(path));
        self
    }

    pub fn video(mut self, source: &VideoSource) -> Self {
        self.args.push(SafeArg::Video(source.clone()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Render and check every argument
    ///
    /// Any rejected argument fails the whole command; nothing is launched.
    pub fn render(&self) -> GuardResult<Vec<OsString>> {
        if self.program.is_empty()
            || self.program.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
        {
            return Err(GuardError::Security("invalid tool program".to_string()));
        }
        self.args
            .iter()
            .map(|arg| arg.render().map(OsString::from))
            .collect()
    }
}

/// Captured result of a tool that exited on its own
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// `None` when the child was ended by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    MemoryExceeded(u64),
}

/// Runs tools under a timeout and a memory ceiling
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    governor: MemoryGovernor,
    check_interval: Duration,
    max_output_bytes: usize,
}

impl ProcessSupervisor {
    pub fn new(governor: MemoryGovernor, check_interval: Duration, max_output_bytes: usize) -> Self {
        Self {
            governor,
            check_interval: check_interval.max(Duration::from_millis(10)),
            max_output_bytes,
        }
    }

    /// Run `command` to completion, a timeout, or a memory breach
    ///
    /// A non-zero exit is still `Ok`; see [`run_checked`](Self::run_checked).
    pub async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        memory_ceiling_mb: u64,
    ) -> GuardResult<ToolOutput> {
        let argv = match command.render() {
            Ok(argv) => argv,
            Err(e) => {
                e.log_rejection(command.program());
                return Err(e);
            }
        };

        let started = Instant::now();
        let mut child = Command::new(command.program())
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(program = command.program(), "Failed to launch tool: {}", e);
                GuardError::Io(e)
            })?;

        let pid = child.id();
        info!(
            program = command.program(),
            pid,
            timeout_secs = timeout.as_secs(),
            memory_ceiling_mb,
            "Tool started"
        );

        let stdout_task = spawn_capture(child.stdout.take(), self.max_output_bytes);
        let stderr_task = spawn_capture(child.stderr.take(), self.max_output_bytes);

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            peak = watch_memory(&self.governor, pid, memory_ceiling_mb, self.check_interval) => {
                Outcome::MemoryExceeded(peak)
            }
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status?;
                let stdout = collect_capture(stdout_task).await;
                let stderr = collect_capture(stderr_task).await;
                let duration = started.elapsed();
                info!(
                    program = command.program(),
                    exit_code = status.code(),
                    duration_ms = duration.as_millis() as u64,
                    "Tool exited"
                );
                Ok(ToolOutput {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    duration,
                })
            }
            Outcome::TimedOut => {
                kill_child(&mut child, command.program()).await;
                stdout_task.abort();
                stderr_task.abort();
                warn!(
                    program = command.program(),
                    timeout_secs = timeout.as_secs_f64(),
                    "Tool timed out and was killed"
                );
                Err(GuardError::Timeout { after: timeout })
            }
            Outcome::MemoryExceeded(peak_mb) => {
                kill_child(&mut child, command.program()).await;
                stdout_task.abort();
                stderr_task.abort();
                warn!(
                    program = command.program(),
                    peak_mb,
                    ceiling_mb = memory_ceiling_mb,
                    "Tool exceeded memory ceiling and was killed"
                );
                Err(GuardError::ResourceExceeded {
                    peak_mb,
                    ceiling_mb: memory_ceiling_mb,
                })
            }
        }
    }

    /// Like [`run`](Self::run), but a non-zero exit becomes `ToolFailure`
    pub async fn run_checked(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        memory_ceiling_mb: u64,
    ) -> GuardResult<ToolOutput> {
        let output = self.run(command, timeout, memory_ceiling_mb).await?;
        if output.success() {
            return Ok(output);
        }

        let detail = failure_detail(&output.stderr);
        error!(
            program = command.program(),
            exit_code = output.exit_code,
            stderr = %detail,
            "Tool failed"
        );
        Err(GuardError::ToolFailure {
            code: output.exit_code,
            detail,
        })
    }
}

async fn kill_child(child: &mut tokio::process::Child, program: &str) {
    if let Err(e) = child.kill().await {
        // Already exited between the deadline and the kill
        debug!(program, "Kill after deadline failed: {}", e);
    }
}

/// Poll the child's RSS until it passes `ceiling_mb`; returns the peak seen
async fn watch_memory(
    governor: &MemoryGovernor,
    pid: Option<u32>,
    ceiling_mb: u64,
    every: Duration,
) -> u64 {
    let Some(pid) = pid else {
        return std::future::pending().await;
    };

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut peak_mb = 0;

    loop {
        ticker.tick().await;
        if let Some(rss_mb) = governor.process_rss_mb(pid) {
            peak_mb = peak_mb.max(rss_mb);
            if rss_mb > ceiling_mb {
                return peak_mb;
            }
        }
    }
}

fn spawn_capture<R>(pipe: Option<R>, limit: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match pipe {
            Some(pipe) => read_bounded(pipe, limit).await,
            None => String::new(),
        }
    })
}

async fn collect_capture(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("Output capture task failed: {}", e);
            String::new()
        }
        Err(_) => {
            // Something the tool spawned still holds the pipe open
            warn!("Output pipe still open after exit, capture truncated");
            String::new()
        }
    }
}

/// Drain `pipe` to EOF keeping at most `limit` bytes
async fn read_bounded<R: AsyncRead + Unpin>(mut pipe: R, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    let mut discarded = 0usize;
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                let take = room.min(n);
                kept.extend_from_slice(&buf[..take]);
                discarded += n - take;
            }
            Err(e) => {
                debug!("Output pipe read failed: {}", e);
                break;
            }
        }
    }
    if discarded > 0 {
        debug!(discarded, "Tool output exceeded capture limit");
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Replace absolute paths with `<path>` and keep the last 512 chars
pub fn failure_detail(stderr: &str) -> String {
    let scrubbed = stderr
        .lines()
        .map(|line| {
            line.split_whitespace()
                .map(|token| if looks_like_path(token) { "<path>" } else { token })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    match scrubbed.char_indices().rev().nth(FAILURE_DETAIL_CHARS - 1) {
        Some((start, _)) => scrubbed[start..].to_string(),
        None => scrubbed,
    }
}

fn looks_like_path(token: &str) -> bool {
    let token = token.trim_start_matches(['\'', '"', '(', '[', '<']);
    if token.starts_with('/') {
        return true;
    }
    let bytes = token.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}
