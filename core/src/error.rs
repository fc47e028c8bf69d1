use reqwest::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, CoreErr>;

/// Errors surfaced by the sandbox provider client.
#[derive(Error, Debug)]
pub enum ProviderErr {
    /// The provider answered with a status we did not expect; the body is
    /// included for diagnostics.
    #[error("provider returned unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum CoreErr {
    /// The SSE stream from the model disconnected or errored out after the
    /// HTTP handshake succeeded but before the turn completed. The caller
    /// treats this as transient and retries with backoff.
    #[error("stream disconnected before completion: {0}")]
    Stream(String),

    /// Command matched the hard security blocklist. No subprocess was
    /// spawned.
    #[error("BLOCKED: Command matches security blocklist.")]
    Blocked,

    /// Command matched a dangerous-but-sometimes-intended pattern and the
    /// caller did not set `confirmed`.
    #[error("CONFIRMATION REQUIRED: Command '{0}' requires confirmed=true")]
    ConfirmationRequired(String),

    #[error("cwd must be an absolute path inside the workspace. Got: {0}")]
    InvalidCwd(String),

    #[error("log not found or expired: {cmd_id}. Recent ids: {recent:?}")]
    LogNotFound { cmd_id: String, recent: Vec<String> },

    /// `read_log` was called more times than the per-log pagination budget
    /// allows. The buffer is untouched.
    #[error("Pagination limit reached ({0} calls). Summarize what you learned and proceed, or re-run the command.")]
    PaginationLimit(u32),

    #[error("Binary output detected. Cannot display.")]
    BinaryOutput,

    #[error("empty command")]
    EmptyCommand,

    #[error("path escapes workspace root: {}", .0.display())]
    PathEscape(PathBuf),

    /// Unexpected HTTP status from the model endpoint.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded against the model endpoint.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    /// The agent loop ran for more iterations than the per-turn cap.
    #[error("agent turn exceeded {0} iterations")]
    IterationLimit(usize),

    /// The event subscriber went away mid-turn; the turn unwinds without
    /// persisting anything.
    #[error("event subscriber disconnected")]
    SubscriberGone,

    #[error("sandbox provider error: {0}")]
    Provider(#[from] ProviderErr),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}
