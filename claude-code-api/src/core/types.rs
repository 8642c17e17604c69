//! The core's own vocabulary: inputs and outputs of the Runner and Worker
//! Pool, independent of any HTTP wire format (spec §3).

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Input to [`crate::core::runner::Runner::run`].
#[derive(Clone)]
pub struct RunOptions {
    pub prompt: String,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub working_directory: Option<PathBuf>,
    pub resume_session_id: Option<String>,
    pub max_turns: Option<u32>,
    pub stream: bool,
    pub on_chunk: Option<mpsc::Sender<StreamChunk>>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn new(prompt: impl Into<String>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            allowed_tools: None,
            working_directory: None,
            resume_session_id: None,
            max_turns: None,
            stream: false,
            on_chunk: None,
            timeout,
            cancel,
        }
    }
}

/// Output of a successful (or gracefully-degraded) Runner invocation.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub result: String,
    pub upstream_session_id: Option<String>,
    pub raw_output: String,
    pub model: Option<String>,
}

/// A single unit of streamed output, delivered in order via `on_chunk`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    End { stop_reason: String },
}
