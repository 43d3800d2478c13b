use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A precondition that must hold before the server can be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationIssue {
    /// No runtime is configured and none could be discovered.
    RuntimeNotFound,
    ServerExecutableNotSet,
    ServerDataPathNotSet,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValidationIssue::RuntimeNotFound => "runtime not found",
            ValidationIssue::ServerExecutableNotSet => "server executable path not set",
            ValidationIssue::ServerDataPathNotSet => "server data path not set",
        })
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of a supervisor operation.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Watch(#[from] WatchError),
}

/// Outcome of a two-phase log watch that never completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The start marker did not appear in time.
    #[error("failed to start")]
    StartTimeout,

    /// The start marker appeared but the end marker did not follow in time.
    #[error("failed to finish")]
    FinishTimeout,
}

/// The runtime executable could not be confirmed as usable.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to launch runtime {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("runtime did not report its version within {0:?}")]
    Timeout(Duration),

    #[error("invalid output from runtime: {0:?}")]
    InvalidOutput(String),

    #[error("runtime version {found} is too old (need {required}.x or newer)")]
    TooOld { found: String, required: u32 },

    #[error("runtime exited with non-zero status {0:?}")]
    ExitStatus(Option<i32>),
}
