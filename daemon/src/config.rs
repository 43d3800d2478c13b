use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::event::DaemonEvent;
use crate::subscription::{Subscribers, Subscription};

pub const DEFAULT_PORT: u16 = 42420;
pub const DEFAULT_MAX_BUFFER_SIZE_GB: f64 = 10.0;
/// Backups are written by the server to `<server_data_path>/Backups`.
pub const BACKUPS_DIR_NAME: &str = "Backups";

/// Root configuration structure. Deserialized from `<config dir>/vssm/config.toml`.
///
/// Plain values come before the `[periodic_backup]` table so the TOML
/// serializer can emit them in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Server executable handed to the runtime as its first argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_executable_path: Option<PathBuf>,
    /// World/data directory passed as `--dataPath`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data_path: Option<PathBuf>,
    /// Port passed as `--port`. Unset or 0 means [`DEFAULT_PORT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Explicit runtime executable; discovered automatically when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_path: Option<PathBuf>,
    /// Generate a backup and wait for it before sending `/stop`.
    #[serde(default)]
    pub create_backup_on_stop: bool,
    #[serde(default)]
    pub periodic_backup: PeriodicBackupConfig,
}

/// Scheduled backups and their disk budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicBackupConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Cron rule, either 5-field (`m h dom mon dow`) or with a leading seconds field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Total size automatic backups may occupy, in GiB.
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size_in_gb: f64,
}

impl Default for PeriodicBackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rule: None,
            max_buffer_size_in_gb: DEFAULT_MAX_BUFFER_SIZE_GB,
        }
    }
}

impl PeriodicBackupConfig {
    /// The configured rule, ignoring blank strings.
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }
}

fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

impl Config {
    pub fn server_executable(&self) -> Option<&Path> {
        non_empty(&self.server_executable_path)
    }

    pub fn server_data(&self) -> Option<&Path> {
        non_empty(&self.server_data_path)
    }

    pub fn runtime(&self) -> Option<&Path> {
        non_empty(&self.runtime_path)
    }

    /// Returns the effective port, falling back to [`DEFAULT_PORT`].
    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(DEFAULT_PORT)
    }

    /// Directory the server writes backups into, if a data path is set.
    pub fn backups_dir(&self) -> Option<PathBuf> {
        self.server_data().map(|data| data.join(BACKUPS_DIR_NAME))
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Serializes `config` to `path`, creating the parent directory if needed.
pub fn save(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

pub type ConfigListener = dyn Fn(&Config) + Send + Sync;

/// Shared, observable configuration.
///
/// One instance is created at startup and cloned into every component that
/// needs settings.  Listeners are notified after each effective change.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: Option<PathBuf>,
    config: RwLock<Config>,
    listeners: Subscribers<ConfigListener>,
}

impl ConfigStore {
    /// Store backed by the file at `path`; `update` persists there.
    pub fn new(path: PathBuf, config: Config) -> Self {
        Self::build(Some(path), config)
    }

    /// Store that never touches the filesystem.
    pub fn in_memory(config: Config) -> Self {
        Self::build(None, config)
    }

    fn build(path: Option<PathBuf>, config: Config) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                config: RwLock::new(config),
                listeners: Subscribers::new(),
            }),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Config {
        match self.inner.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swaps in `config` (e.g. after an on-disk reload) without writing it back.
    /// Listeners run only if something actually changed.
    pub fn replace(&self, config: Config) -> bool {
        if !self.swap(config.clone()) {
            return false;
        }
        self.notify(&config);
        true
    }

    /// Applies `edit`, persists the result and notifies listeners.
    pub fn update(&self, edit: impl FnOnce(&mut Config)) -> Result<Config> {
        let mut config = self.get();
        edit(&mut config);
        if let Some(path) = &self.inner.path {
            tracing::info!(path = %path.display(), "saving config");
            save(path, &config)?;
        }
        self.swap(config.clone());
        self.notify(&config);
        Ok(config)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    fn swap(&self, config: Config) -> bool {
        let mut current = match self.inner.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *current == config {
            return false;
        }
        *current = config;
        true
    }

    fn notify(&self, config: &Config) {
        self.inner.listeners.emit(|listener| listener(config));
    }
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create config file watcher");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            tracing::warn!(path = %path.display(), "config path has no parent directory");
            return;
        }
    };

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, "failed to watch config directory");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to reload config"),
            }
        }
    }
}

fn default_max_buffer_size() -> f64 {
    DEFAULT_MAX_BUFFER_SIZE_GB
}
