//! Typed error hierarchy for the tasker core.
//!
//! Every failure the core can surface is a `TaskerError`. The variants group into
//! the categories callers branch on:
//! - `validation`: malformed input, bad transitions, graph cycles
//! - `concurrency`: lock acquisition timed out (retry with backoff)
//! - `integrity`: a dependency artifact is missing
//! - `recovery`: orphaned tasks or a broken checkpoint need a decision
//! - `corruption` / `schema` / `io` / `internal`: operator intervention required

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code for success.
pub const EXIT_OK: i32 = 0;
/// Exit code for validation and user errors.
pub const EXIT_USER: i32 = 1;
/// Exit code for internal and corruption errors.
pub const EXIT_INTERNAL: i32 = 2;

/// One task definition file that failed to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFileFailure {
    pub file: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for TaskFileFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.file.display(), self.reason)
    }
}

#[derive(Debug, Error)]
pub enum TaskerError {
    #[error("no session found at {}", .path.display())]
    NoSession { path: PathBuf },

    #[error("session already exists at {}", .path.display())]
    SessionExists { path: PathBuf },

    #[error("task {id} not found")]
    UnknownTask { id: String },

    #[error("task {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("duplicate task id {id}")]
    DuplicateTask { id: String },

    #[error("steel thread violation at {task}: {message}")]
    SteelThread { task: String, message: String },

    #[error("document validation failed: {}", .problems.join("; "))]
    InvalidDocument { problems: Vec<String> },

    #[error("{count} task definition(s) failed to load: {}", join_failures(.failures))]
    TaskLoad {
        count: usize,
        failures: Vec<TaskFileFailure>,
    },

    #[error("{0}")]
    Invalid(String),

    #[error("timed out after {}s acquiring lock on {}", .timeout.as_secs(), .path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("task {task_id} is missing dependency artifact(s): {}", .paths.join(", "))]
    MissingDependency {
        task_id: String,
        paths: Vec<String>,
    },

    #[error("orphaned task(s) require a decision (retry or fail): {}", .ids.join(", "))]
    Orphaned { ids: Vec<String> },

    #[error("checkpoint {batch_id} is corrupt: {message}")]
    CorruptCheckpoint { batch_id: String, message: String },

    #[error("checkpoint {batch_id} still has pending task(s): {}", .pending.join(", "))]
    CheckpointInFlight {
        batch_id: String,
        pending: Vec<String>,
    },

    #[error("no active checkpoint")]
    NoCheckpoint,

    #[error("halt requested ({reason}); new dispatch refused")]
    Halted { reason: String },

    #[error("state file {} is corrupt: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("schema version {found} does not match {expected}; migration required")]
    MigrationRequired { found: String, expected: String },

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn join_failures(failures: &[TaskFileFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl TaskerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    /// Machine-readable category printed before the message on stderr.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoSession { .. }
            | Self::SessionExists { .. }
            | Self::UnknownTask { .. }
            | Self::InvalidTransition { .. }
            | Self::Cycle { .. }
            | Self::UnknownDependency { .. }
            | Self::DuplicateTask { .. }
            | Self::SteelThread { .. }
            | Self::InvalidDocument { .. }
            | Self::TaskLoad { .. }
            | Self::Invalid(_)
            | Self::Halted { .. } => "validation",
            Self::LockTimeout { .. } => "concurrency",
            Self::MissingDependency { .. } => "integrity",
            Self::Orphaned { .. }
            | Self::CorruptCheckpoint { .. }
            | Self::CheckpointInFlight { .. }
            | Self::NoCheckpoint => "recovery",
            Self::Corrupt { .. } => "corruption",
            Self::MigrationRequired { .. } => "schema",
            Self::Io { .. } => "io",
            Self::Serialize(_) => "internal",
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            "corruption" | "schema" | "io" | "internal" => EXIT_INTERNAL,
            _ => EXIT_USER,
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type Result<T, E = TaskerError> = std::result::Result<T, E>;

/// Render any error chain as the single-line `<category>: <message>` diagnostic.
pub fn diagnostic_line(err: &anyhow::Error) -> (String, i32) {
    let (category, code) = match err.downcast_ref::<TaskerError>() {
        Some(te) => (te.category(), te.exit_code()),
        None => match err.chain().find_map(|e| e.downcast_ref::<TaskerError>()) {
            Some(te) => (te.category(), te.exit_code()),
            None => ("internal", EXIT_INTERNAL),
        },
    };
    let message = format!("{:#}", err)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (format!("{}: {}", category, message), code)
}
