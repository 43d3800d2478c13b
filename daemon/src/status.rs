use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifecycle phase of the supervised server process.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ServerPhase {
    /// No server process exists.
    Stopped,
    /// The process was spawned but has not announced it is listening yet.
    Starting,
    /// The server printed its ready line and accepts connections.
    Running,
}

/// Runtime status written by the daemon to `<app dir>/status.toml`.
/// External tools read this file to display server state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: ServerPhase,
    /// OS process id of the running server, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Whether the in-game calendar is advancing (players connected).
    pub calendar_running: bool,
    /// File name of the most recently completed backup, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<String>,
    /// RFC 3339 timestamp of the most recently completed backup, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_timestamp: Option<String>,
    /// Human-readable error message from the last failed operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerStatus {
    /// Constructs the initial stopped status on daemon startup.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ServerPhase::Stopped,
            pid: None,
            calendar_running: false,
            last_backup: None,
            last_backup_timestamp: None,
            error: None,
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged; a status write failure never stops the daemon.
pub fn write_status(path: &Path, status: &ServerStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                tracing::error!(error = %e, "failed to write status file");
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to serialize status"),
    }
}
