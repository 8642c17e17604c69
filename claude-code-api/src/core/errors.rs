//! Closed error taxonomy for the request dispatch engine.
//!
//! The core never imports `axum` — it classifies failures into a fixed set
//! of [`ErrorKind`]s and leaves wire-format rendering to the HTTP surfaces
//! (see `models::error::ApiError`).

use std::fmt;

use serde_json::Value;

/// The closed set of failure kinds the dispatch engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    InvalidRequest,
    Timeout,
    QueueTimeout,
    QueueFull,
    RateLimit,
    UpstreamAuth,
    CliError,
    CliNotFound,
    Memory,
    SessionNotFound,
    SessionLimit,
    TaskNotFound,
    InvalidModel,
    StreamingNotSupported,
    Internal,
}

impl ErrorKind {
    /// The canonical HTTP status code for this kind (spec §4.5).
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Auth => 401,
            ErrorKind::InvalidRequest => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::QueueTimeout => 504,
            ErrorKind::QueueFull => 429,
            ErrorKind::RateLimit => 429,
            ErrorKind::UpstreamAuth => 401,
            ErrorKind::SessionNotFound => 404,
            ErrorKind::TaskNotFound => 404,
            ErrorKind::SessionLimit => 429,
            ErrorKind::StreamingNotSupported => 400,
            ErrorKind::InvalidModel => 400,
            ErrorKind::CliError | ErrorKind::CliNotFound | ErrorKind::Memory | ErrorKind::Internal => 500,
        }
    }

    /// Machine-readable code, stable across releases.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QueueTimeout => "queue_timeout",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::UpstreamAuth => "upstream_auth",
            ErrorKind::CliError => "cli_error",
            ErrorKind::CliNotFound => "cli_not_found",
            ErrorKind::Memory => "memory",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionLimit => "session_limit",
            ErrorKind::TaskNotFound => "task_not_found",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::StreamingNotSupported => "streaming_not_supported",
            ErrorKind::Internal => "internal",
        }
    }

    /// Retryability is a pure function of kind (spec §4.2/§4.5): only
    /// `timeout` and `rate_limit` are retried by the worker pool.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::RateLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A value-typed error record produced by any failure path in the core.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Retryable by kind, or a transport-level reset on an otherwise
    /// uncategorized IO failure (spec §4.5).
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable() || is_transport_reset(&self.message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn queue_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueTimeout, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn upstream_auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamAuth, message)
    }

    pub fn cli_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CliError, message)
    }

    pub fn cli_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CliNotFound, message)
    }

    pub fn memory(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Memory, message)
    }

    pub fn session_not_found() -> Self {
        Self::new(ErrorKind::SessionNotFound, "session not found")
    }

    pub fn session_limit(max: usize) -> Self {
        Self::new(
            ErrorKind::SessionLimit,
            format!("owner already holds the maximum of {max} sessions"),
        )
    }

    pub fn task_not_found() -> Self {
        Self::new(ErrorKind::TaskNotFound, "task not found")
    }

    pub fn invalid_model(model: impl Into<String>) -> Self {
        let model = model.into();
        Self::new(ErrorKind::InvalidModel, format!("unknown model: {model}"))
    }

    pub fn streaming_not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StreamingNotSupported, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// The submission was aborted by a cancellation handle firing: client
    /// disconnect, explicit task cancel, or pool shutdown (spec §5).
    pub fn aborted(reason: &str) -> Self {
        Self::new(ErrorKind::CliError, format!("aborted: {reason}"))
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

/// Detects a transport-level reset on an error whose kind doesn't already
/// capture it (e.g. an IO error surfaced as a bare string from a lower
/// layer). Used only to extend retryability beyond `timeout`/`rate_limit`.
fn is_transport_reset(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("connection reset") || m.contains("broken pipe") || m.contains("reset by peer")
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::CliNotFound.is_retryable());
        assert!(!ErrorKind::SessionNotFound.is_retryable());
    }

    #[test]
    fn transport_reset_is_retryable_even_without_kind_match() {
        let err = CoreError::cli_error("connection reset by peer");
        assert!(err.is_retryable());
    }

    #[test]
    fn http_statuses_match_spec_table() {
        assert_eq!(ErrorKind::Auth.http_status(), 401);
        assert_eq!(ErrorKind::QueueFull.http_status(), 429);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::QueueTimeout.http_status(), 504);
        assert_eq!(ErrorKind::SessionNotFound.http_status(), 404);
        assert_eq!(ErrorKind::TaskNotFound.http_status(), 404);
        assert_eq!(ErrorKind::SessionLimit.http_status(), 429);
        assert_eq!(ErrorKind::StreamingNotSupported.http_status(), 400);
        assert_eq!(ErrorKind::InvalidModel.http_status(), 400);
        assert_eq!(ErrorKind::CliError.http_status(), 500);
        assert_eq!(ErrorKind::CliNotFound.http_status(), 500);
        assert_eq!(ErrorKind::Memory.http_status(), 500);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }
}
