//! Spawns and supervises one CLI invocation (spec §4.1).
//!
//! Argument assembly, stdio capture, timeout, cooperative cancellation,
//! SIGTERM→SIGKILL escalation, stdout JSON parsing and streaming line demux
//! all live here. The Runner never retries and never queues — that's the
//! Worker Pool's job.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::core::errors::{CoreError, CoreResult, ErrorKind};
use crate::core::types::{RunOptions, RunResult, StreamChunk};

/// Grace period between SIGTERM and SIGKILL (spec GLOSSARY).
const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct Runner {
    claude_command: String,
}

impl Runner {
    pub fn new(claude_command: impl Into<String>) -> Self {
        Self {
            claude_command: claude_command.into(),
        }
    }

    /// Spawn the CLI and return once it exits, times out, or is cancelled.
    pub async fn run(&self, opts: RunOptions) -> CoreResult<RunResult> {
        if opts.cancel.is_cancelled() {
            return Err(CoreError::cli_error("aborted before start"));
        }

        if let Some(wd) = &opts.working_directory {
            validate_working_directory(wd)?;
            tokio::fs::create_dir_all(wd).await.map_err(|e| {
                CoreError::cli_error(format!("failed to create working directory: {e}"))
            })?;
        }

        let mut cmd = Command::new(&self.claude_command);
        cmd.args(build_args(&opts));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(wd) = &opts.working_directory {
            cmd.current_dir(wd);
        }

        info!(
            stream = opts.stream,
            has_resume = opts.resume_session_id.is_some(),
            "spawning CLI"
        );

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::cli_not_found(format!(
                    "{} not found on PATH: {e}",
                    self.claude_command
                )));
            },
            Err(e) => return Err(CoreError::cli_error(format!("failed to spawn CLI: {e}"))),
        };

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stream = opts.stream;
        let on_chunk = opts.on_chunk.clone();
        let stdout_task = tokio::spawn(consume_stdout(stdout, stream, on_chunk));
        let stderr_task = tokio::spawn(consume_stderr(stderr));

        let timeout_fut = tokio::time::sleep(opts.timeout);
        tokio::pin!(timeout_fut);

        enum Outcome {
            Exited(ExitStatus),
            TimedOut,
            Cancelled,
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                Outcome::Exited(status.map_err(|e| CoreError::cli_error(format!("wait failed: {e}")))?)
            }
            _ = &mut timeout_fut => Outcome::TimedOut,
            _ = opts.cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::TimedOut => {
                warn!("CLI run exceeded {:?} timeout, escalating", opts.timeout);
                let _ = escalate_kill(&mut child).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                Err(CoreError::timeout(format!(
                    "CLI did not complete within {:?}",
                    opts.timeout
                )))
            },
            Outcome::Cancelled => {
                warn!("run cancelled, escalating SIGTERM/SIGKILL");
                let _ = escalate_kill(&mut child).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                Err(CoreError::aborted("client_disconnect"))
            },
            Outcome::Exited(status) => {
                let stdout_capture = stdout_task
                    .await
                    .map_err(|e| CoreError::internal(format!("stdout reader panicked: {e}")))?;
                let stderr_text = stderr_task.await.unwrap_or_default();

                if status.success() {
                    match stdout_capture {
                        StdoutCapture::Buffered(raw) => parse_stdout(&raw),
                        StdoutCapture::Streamed(demux) => Ok(demux.into_result()),
                    }
                } else {
                    Err(classify_exit_failure(&stderr_text, &status))
                }
            },
        }
    }
}

fn validate_working_directory(path: &Path) -> CoreResult<()> {
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(CoreError::invalid_request(
            "working_directory must not contain '..'",
        ));
    }
    Ok(())
}

/// Deterministic, order-independent argv assembly (spec §4.1).
fn build_args(opts: &RunOptions) -> Vec<String> {
    let mut args = vec!["-p".to_string(), opts.prompt.clone()];

    args.push("--output-format".to_string());
    args.push(if opts.stream { "stream-json" } else { "json" }.to_string());

    args.push("--dangerously-skip-permissions".to_string());

    if let Some(model) = &opts.model {
        args.push("--model".to_string());
        args.push(model.to_lowercase());
    }

    if let Some(tools) = &opts.allowed_tools
        && !tools.is_empty()
    {
        args.push("--allowedTools".to_string());
        args.push(tools.join(","));
    }

    if let Some(resume) = &opts.resume_session_id {
        args.push("--resume".to_string());
        args.push(resume.clone());
    }

    if let Some(max_turns) = opts.max_turns
        && max_turns > 0
    {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }

    args
}

async fn escalate_kill(child: &mut Child) -> io::Result<()> {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is the live child's pid as reported by tokio; sending
        // a signal to it is the documented way to request graceful exit.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(_) => Ok(()),
        Err(_) => {
            warn!("child ignored SIGTERM past grace period, sending SIGKILL");
            child.start_kill()?;
            child.wait().await?;
            Ok(())
        },
    }
}

enum StdoutCapture {
    Buffered(String),
    Streamed(StreamDemux),
}

async fn consume_stdout(
    stdout: tokio::process::ChildStdout,
    stream: bool,
    on_chunk: Option<mpsc::Sender<StreamChunk>>,
) -> StdoutCapture {
    if !stream {
        let mut buf = String::new();
        let mut reader = stdout;
        let _ = reader.read_to_string(&mut buf).await;
        return StdoutCapture::Buffered(buf);
    }

    let mut demux = StreamDemux::new();
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(chunk) = demux.feed_line(&line)
                    && let Some(tx) = &on_chunk
                    && tx.send(chunk).await.is_err()
                {
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!("error reading CLI stdout: {e}");
                break;
            },
        }
    }

    StdoutCapture::Streamed(demux)
}

async fn consume_stderr(stderr: tokio::process::ChildStderr) -> String {
    let mut buf = String::new();
    let mut reader = stderr;
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

/// Non-streaming stdout parse: the whole trimmed buffer must be one JSON
/// object. Any shape mismatch or parse failure degrades gracefully to the
/// raw text rather than failing the request (spec §4.1).
fn parse_stdout(raw: &str) -> CoreResult<RunResult> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::cli_error("CLI exited 0 with empty stdout"));
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) if map.get("result").and_then(|v| v.as_str()).is_some() => {
            let result_text = map["result"].as_str().unwrap().to_string();
            let is_error = map.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false);
            if is_error {
                return Err(CoreError::cli_error(result_text));
            }
            Ok(RunResult {
                result: result_text,
                upstream_session_id: map
                    .get("session_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                raw_output: trimmed.to_string(),
                model: map.get("model").and_then(|v| v.as_str()).map(str::to_string),
            })
        },
        _ => Ok(RunResult {
            result: trimmed.to_string(),
            upstream_session_id: None,
            raw_output: trimmed.to_string(),
            model: None,
        }),
    }
}

fn classify_stderr(stderr: &str) -> ErrorKind {
    let s = stderr.to_lowercase();
    if s.contains("rate limit") || s.contains("too many requests") {
        ErrorKind::RateLimit
    } else if s.contains("authentication") || s.contains("not logged in") || s.contains("login") {
        ErrorKind::UpstreamAuth
    } else if s.contains("out of memory") || s.contains("heap limit") || s.contains("allocation failed") {
        ErrorKind::Memory
    } else {
        ErrorKind::CliError
    }
}

fn classify_exit_failure(stderr: &str, status: &ExitStatus) -> CoreError {
    let trimmed = stderr.trim();
    let kind = classify_stderr(trimmed);
    let details = json!({
        "exit_code": status.code(),
        "signal": unix_signal(status),
        "stderr": trimmed,
    });

    let err = match kind {
        ErrorKind::RateLimit => CoreError::rate_limit(trimmed.to_string()),
        ErrorKind::UpstreamAuth => CoreError::upstream_auth(trimmed.to_string()),
        ErrorKind::Memory => CoreError::memory(trimmed.to_string()),
        _ => CoreError::cli_error(trimmed.to_string()),
    };
    err.with_details(details)
}

#[cfg(unix)]
fn unix_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Incremental parser over newline-delimited JSON from `--output-format
/// stream-json` (spec §4.1 Streaming demux).
struct StreamDemux {
    accumulated: String,
    raw: String,
    session_id: Option<String>,
    model: Option<String>,
}

impl StreamDemux {
    fn new() -> Self {
        Self {
            accumulated: String::new(),
            raw: String::new(),
            session_id: None,
            model: None,
        }
    }

    /// Feed one complete line; returns a chunk to emit, or `None` if the
    /// line was blank, malformed, or of a type the demux doesn't surface.
    /// Malformed lines are logged and skipped — never fatal.
    fn feed_line(&mut self, line: &str) -> Option<StreamChunk> {
        if line.trim().is_empty() {
            return None;
        }
        self.raw.push_str(line);
        self.raw.push('\n');

        let v: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping malformed stream-json line: {e}");
                return None;
            },
        };

        if let Some(sid) = v.get("session_id").and_then(|x| x.as_str()) {
            self.session_id = Some(sid.to_string());
        }

        match v.get("type").and_then(|x| x.as_str()).unwrap_or("") {
            "content_block_delta" => {
                let text = v.get("delta").and_then(|d| d.get("text")).and_then(|t| t.as_str())?;
                self.accumulated.push_str(text);
                Some(StreamChunk::Delta { text: text.to_string() })
            },
            "assistant" => {
                let message = v.get("message")?;
                if let Some(m) = message.get("model").and_then(|x| x.as_str()) {
                    self.model = Some(m.to_string());
                }
                let text = match message.get("content") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Array(items)) => items
                        .first()
                        .and_then(|c| c.get("text"))
                        .and_then(|t| t.as_str())
                        .map(str::to_string),
                    _ => None,
                }?;
                self.accumulated.push_str(&text);
                Some(StreamChunk::Delta { text })
            },
            "message_stop" | "message_end" => {
                let stop_reason = v
                    .get("message")
                    .and_then(|m| m.get("stop_reason"))
                    .and_then(|x| x.as_str())
                    .unwrap_or("end_turn")
                    .to_string();
                Some(StreamChunk::End { stop_reason })
            },
            _ => None,
        }
    }

    fn into_result(self) -> RunResult {
        RunResult {
            result: self.accumulated,
            upstream_session_id: self.session_id,
            raw_output: self.raw.trim().to_string(),
            model: self.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn opts(prompt: &str) -> RunOptions {
        RunOptions::new(prompt, Duration::from_secs(30), CancellationToken::new())
    }

    #[test]
    fn build_args_minimal() {
        let args = build_args(&opts("hi"));
        assert_eq!(
            args,
            vec![
                "-p",
                "hi",
                "--output-format",
                "json",
                "--dangerously-skip-permissions"
            ]
        );
    }

    #[test]
    fn build_args_stream_mode_switches_output_format() {
        let mut o = opts("hi");
        o.stream = true;
        let args = build_args(&o);
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn build_args_full() {
        let mut o = opts("hi");
        o.model = Some("Claude-Opus".to_string());
        o.allowed_tools = Some(vec!["Bash".to_string(), "Read".to_string()]);
        o.resume_session_id = Some("sess-123".to_string());
        o.max_turns = Some(5);
        let args = build_args(&o);
        assert!(args.windows(2).any(|w| w == ["--model", "claude-opus"]));
        assert!(args.windows(2).any(|w| w == ["--allowedTools", "Bash,Read"]));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-123"]));
        assert!(args.windows(2).any(|w| w == ["--max-turns", "5"]));
    }

    #[test]
    fn build_args_skips_zero_max_turns() {
        let mut o = opts("hi");
        o.max_turns = Some(0);
        let args = build_args(&o);
        assert!(!args.contains(&"--max-turns".to_string()));
    }

    #[test]
    fn working_directory_rejects_dotdot() {
        let err = validate_working_directory(Path::new("../escape")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn parse_stdout_happy_path() {
        let raw = r#"{"result":"hello","session_id":"U"}"#;
        let r = parse_stdout(raw).unwrap();
        assert_eq!(r.result, "hello");
        assert_eq!(r.upstream_session_id.as_deref(), Some("U"));
    }

    #[test]
    fn parse_stdout_is_error_raises_cli_error() {
        let raw = r#"{"result":"boom","is_error":true}"#;
        let err = parse_stdout(raw).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CliError);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn parse_stdout_falls_back_to_raw_text_on_malformed_json() {
        let raw = "not json at all";
        let r = parse_stdout(raw).unwrap();
        assert_eq!(r.result, "not json at all");
        assert!(r.upstream_session_id.is_none());
    }

    #[test]
    fn parse_stdout_empty_is_error() {
        let err = parse_stdout("   ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CliError);
    }

    #[test]
    fn classify_stderr_rate_limit() {
        assert_eq!(classify_stderr("Error: rate limit exceeded"), ErrorKind::RateLimit);
        assert_eq!(classify_stderr("too many requests"), ErrorKind::RateLimit);
    }

    #[test]
    fn classify_stderr_upstream_auth() {
        assert_eq!(classify_stderr("please login again"), ErrorKind::UpstreamAuth);
        assert_eq!(classify_stderr("Authentication failed"), ErrorKind::UpstreamAuth);
    }

    #[test]
    fn classify_stderr_memory() {
        assert_eq!(classify_stderr("FATAL: out of memory"), ErrorKind::Memory);
        assert_eq!(classify_stderr("JS heap limit Allocation failed"), ErrorKind::Memory);
    }

    #[test]
    fn classify_stderr_default_is_cli_error() {
        assert_eq!(classify_stderr("some other failure"), ErrorKind::CliError);
    }

    #[test]
    fn stream_demux_content_block_delta() {
        let mut demux = StreamDemux::new();
        let chunk = demux.feed_line(r#"{"type":"content_block_delta","delta":{"text":"hi"}}"#);
        assert_eq!(chunk, Some(StreamChunk::Delta { text: "hi".to_string() }));
    }

    #[test]
    fn stream_demux_assistant_array_content() {
        let mut demux = StreamDemux::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"yo"}]}}"#;
        let chunk = demux.feed_line(line);
        assert_eq!(chunk, Some(StreamChunk::Delta { text: "yo".to_string() }));
    }

    #[test]
    fn stream_demux_message_stop_emits_end() {
        let mut demux = StreamDemux::new();
        let chunk = demux.feed_line(r#"{"type":"message_stop","message":{"stop_reason":"end_turn"}}"#);
        assert_eq!(
            chunk,
            Some(StreamChunk::End {
                stop_reason: "end_turn".to_string()
            })
        );
    }

    #[test]
    fn stream_demux_defaults_stop_reason_when_absent() {
        let mut demux = StreamDemux::new();
        let chunk = demux.feed_line(r#"{"type":"message_end"}"#);
        assert_eq!(
            chunk,
            Some(StreamChunk::End {
                stop_reason: "end_turn".to_string()
            })
        );
    }

    #[test]
    fn stream_demux_skips_malformed_line_without_panicking() {
        let mut demux = StreamDemux::new();
        let chunk = demux.feed_line("{not json");
        assert_eq!(chunk, None);
    }

    #[test]
    fn stream_demux_unknown_type_is_skipped() {
        let mut demux = StreamDemux::new();
        let chunk = demux.feed_line(r#"{"type":"content_block_start"}"#);
        assert_eq!(chunk, None);
    }

    #[test]
    fn stream_demux_accumulates_into_final_result() {
        let mut demux = StreamDemux::new();
        demux.feed_line(r#"{"type":"content_block_delta","delta":{"text":"ab"}}"#);
        demux.feed_line(r#"{"type":"content_block_delta","delta":{"text":"cd"}}"#);
        demux.feed_line(r#"{"type":"message_stop","session_id":"S1"}"#);
        let result = demux.into_result();
        assert_eq!(result.result, "abcd");
        assert_eq!(result.upstream_session_id.as_deref(), Some("S1"));
    }
}
