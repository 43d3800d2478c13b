/// Discovery and validation of the `dotnet` runtime that hosts the server.
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::Config;
use crate::error::RuntimeError;

pub const RUNTIME_COMMAND: &str = "dotnet";
/// Oldest major version the server runs on.
pub const MIN_MAJOR_VERSION: u32 = 7;
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Parses `MAJOR.MINOR.PATCH` exactly.  Pre-release suffixes are rejected.
pub fn parse_version(text: &str) -> Option<RuntimeVersion> {
    let mut parts = text.split('.');
    let mut next = || {
        parts
            .next()
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|p| p.parse::<u32>().ok())
    };
    let version = RuntimeVersion {
        major: next()?,
        minor: next()?,
        patch: next()?,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(version)
}

/// Locates the runtime on `PATH`, then at the per-user install location.
pub fn find_runtime() -> Option<PathBuf> {
    if let Ok(path) = which::which(RUNTIME_COMMAND) {
        return Some(path);
    }
    user_install_candidate().filter(|p| p.is_file())
}

#[cfg(windows)]
fn user_install_candidate() -> Option<PathBuf> {
    // %LOCALAPPDATA%\Microsoft\dotnet\dotnet.exe
    dirs::data_local_dir().map(|dir| dir.join("Microsoft").join("dotnet").join("dotnet.exe"))
}

#[cfg(not(windows))]
fn user_install_candidate() -> Option<PathBuf> {
    // ~/.dotnet/dotnet, where the official install script puts it.
    dirs::home_dir().map(|home| home.join(".dotnet").join(RUNTIME_COMMAND))
}

/// The runtime to launch the server with: the configured path if set,
/// otherwise whatever [`find_runtime`] discovers.
pub fn resolve(config: &Config) -> Option<PathBuf> {
    config
        .runtime()
        .map(Path::to_path_buf)
        .or_else(find_runtime)
}

/// Runs `<path> --version` and checks the reported version.
pub async fn validate_executable(path: &Path) -> Result<RuntimeVersion, RuntimeError> {
    validate_executable_with_timeout(path, VERSION_PROBE_TIMEOUT).await
}

pub async fn validate_executable_with_timeout(
    path: &Path,
    limit: Duration,
) -> Result<RuntimeVersion, RuntimeError> {
    let child = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| RuntimeError::Launch {
            path: path.to_path_buf(),
            source,
        })?;

    // On timeout the child is dropped, and with it killed.
    let output = tokio::time::timeout(limit, child.wait_with_output())
        .await
        .map_err(|_| RuntimeError::Timeout(limit))?
        .map_err(|source| RuntimeError::Launch {
            path: path.to_path_buf(),
            source,
        })?;

    let reported = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if reported.is_empty() && !output.status.success() {
        return Err(RuntimeError::ExitStatus(output.status.code()));
    }
    let version =
        parse_version(&reported).ok_or_else(|| RuntimeError::InvalidOutput(reported.clone()))?;
    if version.major < MIN_MAJOR_VERSION {
        return Err(RuntimeError::TooOld {
            found: reported,
            required: MIN_MAJOR_VERSION,
        });
    }
    tracing::debug!(path = %path.display(), %version, "runtime validated");
    Ok(version)
}
