/// Canonical file paths for vssm data files.
///
/// Both files live in the application directory (`<config dir>/vssm/`, or
/// `$VSSM_HOME` when set):
///   - config.toml  Edited by the user or the console, read by the daemon.
///   - status.toml  Written by the daemon for external tools to poll.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const APP_DIR_NAME: &str = "vssm";
pub const HOME_ENV_VAR: &str = "VSSM_HOME";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const STATUS_FILE_NAME: &str = "status.toml";

/// Returns the application directory, honouring `$VSSM_HOME`.
pub fn app_data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV_VAR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .context("no per-user configuration directory on this platform; set VSSM_HOME")
}

pub fn config_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(CONFIG_FILE_NAME)
}

pub fn status_file_path(app_dir: &Path) -> PathBuf {
    app_dir.join(STATUS_FILE_NAME)
}
