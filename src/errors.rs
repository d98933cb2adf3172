//! Typed error hierarchy for the kiln daemon.
//!
//! Four top-level enums cover the subsystem boundaries:
//! - `ConfigError` — startup configuration failures (always fatal)
//! - `TicketError` — tracker API failures, classified for retry
//! - `ExecutorError` — executor subprocess failures
//! - `WorkspaceError` — git worktree lifecycle failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
/// Any of these causes the daemon to refuse to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid line {line} in config file: {content}")]
    InvalidLine { line: usize, content: String },

    #[error("Missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(
        "GITHUB_TOKEN and GITHUB_ENTERPRISE_* are mutually exclusive; configure exactly one host"
    )]
    ConflictingHosts,

    #[error("Project URL {url} does not belong to configured host {host}")]
    ProjectHostMismatch { url: String, host: String },
}

/// Errors from the ticket-tracker client.
///
/// The variant is the retry classification: `Transient` is retried with
/// backoff inside the client, `Auth` is fatal, everything else is surfaced
/// to the caller to handle per operation.
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Transient API error: {0}")]
    Transient(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TicketError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Errors from a single executor subprocess run.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to spawn executor process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Executor exceeded wall-clock timeout of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("Executor produced no output for {limit_secs}s")]
    Idle { limit_secs: u64 },

    #[error("Executor exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Executor run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    /// Timeouts get a distinct run outcome; everything else is a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Idle { .. })
    }
}

/// Errors from workspace (worktree) management.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("Path {path} escapes the workspaces root")]
    PathEscape { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
