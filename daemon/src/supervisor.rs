/// Supervision of the single dedicated-server process.
///
/// The [`Server`] owns the child process, its stdin command channel and the
/// calendar state derived from its output.  Everything else talks to the
/// process through the operations here.
///
/// Lifecycle: `Stopped → Starting → Running → Stopped`.  `Starting` lasts from
/// spawn until the server prints its ready line.
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{Config, ConfigStore};
use crate::error::{ServerError, ValidationIssue};
use crate::log_bus::{LineBuffer, LogBus};
use crate::message::Channel;
use crate::retention::AUTO_BACKUP_PREFIX;
use crate::runtime;
use crate::status::ServerPhase;
use crate::subscription::{lock, Subscribers, Subscription};
use crate::watcher::{LogPattern, LogWatcher, WatchSpec};

pub const CALENDAR_PAUSED_TEXT: &str = "All clients disconnected, pausing game calendar.";
pub const CALENDAR_RESUMED_TEXT: &str = "A client reconnected, resuming game calendar.";
pub const BACKUP_STARTED_TEXT: &str = "Ok, generating backup, this might take a while";
pub const BACKUP_COMPLETE_TEXT: &str = "Backup complete!";
pub const STOP_COMMAND: &str = "/stop";
pub const BACKUP_FILE_EXTENSION: &str = "vcdbs";

/// How long output is still collected after the process has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// The ServerEvent line announcing the server accepts connections.
pub fn ready_text(port: u16) -> String {
    format!("Dedicated Server now running on Port {port} and all ips!")
}

/// `<prefix>vssm-<yyyy-MM-dd_HH-mm-ss>.vcdbs`
pub fn backup_file_name(prefix: &str, at: DateTime<Local>) -> String {
    format!(
        "{prefix}vssm-{}.{BACKUP_FILE_EXTENSION}",
        at.format("%Y-%m-%d_%H-%M-%S")
    )
}

fn backup_watch_spec() -> WatchSpec {
    WatchSpec {
        start: LogPattern::new(Channel::ServerNotification, BACKUP_STARTED_TEXT),
        end: LogPattern::new(Channel::ServerNotification, BACKUP_COMPLETE_TEXT),
    }
}

/// Receives everything the supervisor reports outward.
///
/// Implementations must not call back into the [`Server`].
pub trait ServerOutput: Send + Sync {
    /// Raw stdout chunk, exactly as read.
    fn stdout(&self, chunk: &str);
    /// Raw stderr chunk.  Never treated as fatal.
    fn stderr(&self, chunk: &str);
    /// The process exited; `None` when it was terminated by a signal.
    fn closed(&self, code: Option<i32>);
    fn state_changed(&self, _phase: ServerPhase) {}
    /// A backup finished, whoever requested it.
    fn backup_created(&self, _name: &str) {}
}

pub type CalendarListener = dyn Fn(bool) + Send + Sync;

struct ProcessHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
    closed: watch::Receiver<bool>,
}

struct ServerState {
    phase: ServerPhase,
    process: Option<ProcessHandle>,
    calendar_running: bool,
    /// Bumped on every spawn so exit notices from an older process are ignored.
    generation: u64,
    ready_watch: Option<Subscription>,
}

struct Inner {
    config: ConfigStore,
    output: Arc<dyn ServerOutput>,
    watcher: LogWatcher,
    state: Mutex<ServerState>,
    calendar_listeners: Subscribers<CalendarListener>,
    /// Serializes backups and stops against the same process.
    operation: tokio::sync::Mutex<()>,
    calendar_watches: Vec<Subscription>,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(config: ConfigStore, output: Arc<dyn ServerOutput>) -> Self {
        Self::with_watcher(config, output, LogWatcher::new(LogBus::new()))
    }

    pub fn with_watcher(
        config: ConfigStore,
        output: Arc<dyn ServerOutput>,
        watcher: LogWatcher,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let calendar_watches = [(CALENDAR_PAUSED_TEXT, false), (CALENDAR_RESUMED_TEXT, true)]
                .into_iter()
                .map(|(text, running)| {
                    let weak = weak.clone();
                    watcher.permanent_watch(
                        LogPattern::new(Channel::ServerNotification, text),
                        move || {
                            if let Some(inner) = weak.upgrade() {
                                inner.set_calendar(running);
                            }
                        },
                    )
                })
                .collect();

            Inner {
                config,
                output,
                watcher,
                state: Mutex::new(ServerState {
                    phase: ServerPhase::Stopped,
                    process: None,
                    calendar_running: false,
                    generation: 0,
                    ready_watch: None,
                }),
                calendar_listeners: Subscribers::new(),
                operation: tokio::sync::Mutex::new(()),
                calendar_watches,
            }
        });
        Self { inner }
    }

    /// Missing preconditions for [`start`](Self::start).  Does not touch state.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        validate_config(&self.inner.config.get())
    }

    /// Spawns `<runtime> <executable> --dataPath <data> --port <port>`.
    ///
    /// Returns once the process is spawned; the phase moves to `Running` when
    /// the ready line is printed.  Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let config = self.inner.config.get();
        let mut state = lock(&self.inner.state);
        if state.process.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let (Some(runtime), Some(executable), Some(data)) = (
            runtime::resolve(&config),
            config.server_executable(),
            config.server_data(),
        ) else {
            return Err(ServerError::Validation(validate_config(&config)));
        };
        let port = config.port();

        let mut child = Command::new(&runtime)
            .arg(executable)
            .arg("--dataPath")
            .arg(data)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ServerError::Spawn)?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ServerError::Spawn(std::io::Error::other(
                "server process stdio was not captured",
            )));
        };

        state.generation += 1;
        let generation = state.generation;
        let pid = child.id();

        // Registered before the stdout pump exists so the ready line cannot be missed.
        let weak = Arc::downgrade(&self.inner);
        state.ready_watch = Some(self.inner.watcher.once(
            LogPattern::new(Channel::ServerEvent, ready_text(port)),
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.mark_ready(generation);
                }
            },
        ));

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_commands(stdin, stdin_rx));

        let bus = self.inner.watcher.bus().clone();
        let stdout_task = tokio::spawn(pump_stdout(stdout, bus, Arc::clone(&self.inner.output)));
        let stderr_task = tokio::spawn(pump_stderr(stderr, Arc::clone(&self.inner.output)));

        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(wait_for_exit(
            child,
            [stdout_task, stderr_task],
            Arc::downgrade(&self.inner),
            generation,
            closed_tx,
        ));

        state.process = Some(ProcessHandle {
            generation,
            pid,
            stdin: stdin_tx,
            closed: closed_rx,
        });
        state.phase = ServerPhase::Starting;
        // Reported under the lock so it cannot trail the ready transition.
        self.inner.output.state_changed(ServerPhase::Starting);
        drop(state);

        tracing::info!(
            runtime = %runtime.display(),
            executable = %executable.display(),
            data = %data.display(),
            port,
            pid,
            "server process started"
        );
        Ok(())
    }

    /// Stops the server and waits for the process to exit.
    ///
    /// With `create_backup_on_stop` a backup is generated and awaited first;
    /// if it fails the stop is abandoned and the error returned.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let _operation = self.inner.operation.lock().await;
        let mut closed = self.closed_receiver().ok_or(ServerError::NotRunning)?;

        if self.inner.config.get().create_backup_on_stop {
            tracing::info!("creating backup before stopping");
            self.backup_locked(AUTO_BACKUP_PREFIX).await?;
        }

        tracing::info!("stopping server");
        self.send_command(STOP_COMMAND);
        // Errors only if the exit task vanished, which also means the process is gone.
        let _ = closed.wait_for(|closed| *closed).await;
        Ok(())
    }

    /// Writes `command` plus CRLF to the server's stdin.  No-op when stopped.
    pub fn send_command(&self, command: &str) {
        let state = lock(&self.inner.state);
        if let Some(process) = &state.process {
            tracing::debug!(command, "sending command");
            let _ = process.stdin.send(format!("{command}\r\n"));
        }
    }

    /// Asks the server for a backup and waits until it reports completion.
    /// Resolves with the backup's file name.
    pub async fn generate_backup(&self, prefix: &str) -> Result<String, ServerError> {
        let _operation = self.inner.operation.lock().await;
        self.backup_locked(prefix).await
    }

    async fn backup_locked(&self, prefix: &str) -> Result<String, ServerError> {
        if !self.is_running() {
            return Err(ServerError::NotRunning);
        }
        let name = backup_file_name(prefix, Local::now());
        let command = format!("/genbackup {name}");
        tracing::info!(file = %name, "generating backup");

        self.inner
            .watcher
            .watch(backup_watch_spec(), || self.send_command(&command))
            .await?;

        tracing::info!(file = %name, "backup complete");
        self.inner.output.backup_created(&name);
        Ok(name)
    }

    /// Registers `listener` for calendar pause (`false`) and resume (`true`).
    pub fn add_calendar_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.calendar_listeners.add(Arc::new(listener))
    }

    pub fn phase(&self) -> ServerPhase {
        lock(&self.inner.state).phase
    }

    /// True while a process exists, whether or not it has finished starting.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).process.is_some()
    }

    pub fn is_calendar_running(&self) -> bool {
        lock(&self.inner.state).calendar_running
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.state).process.as_ref().and_then(|p| p.pid)
    }

    /// The bus every stdout line is published on.
    pub fn logs(&self) -> &LogBus {
        self.inner.watcher.bus()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }

    fn closed_receiver(&self) -> Option<watch::Receiver<bool>> {
        lock(&self.inner.state)
            .process
            .as_ref()
            .map(|p| p.closed.clone())
    }
}

fn validate_config(config: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if runtime::resolve(config).is_none() {
        issues.push(ValidationIssue::RuntimeNotFound);
    }
    if config.server_executable().is_none() {
        issues.push(ValidationIssue::ServerExecutableNotSet);
    }
    if config.server_data().is_none() {
        issues.push(ValidationIssue::ServerDataPathNotSet);
    }
    issues
}

impl Inner {
    fn set_calendar(&self, running: bool) {
        lock(&self.state).calendar_running = running;
        tracing::info!(running, "game calendar changed");
        self.calendar_listeners.emit(|listener| listener(running));
    }

    fn mark_ready(&self, generation: u64) {
        {
            let mut state = lock(&self.state);
            let current = state.process.as_ref().map(|p| p.generation);
            if current != Some(generation) || state.phase != ServerPhase::Starting {
                return;
            }
            state.phase = ServerPhase::Running;
            state.ready_watch = None;
        }
        tracing::info!("server is ready");
        self.output.state_changed(ServerPhase::Running);
    }

    fn handle_closed(&self, generation: u64, code: Option<i32>) {
        let (was_calendar_running, ready_watch) = {
            let mut state = lock(&self.state);
            let current = state.process.as_ref().map(|p| p.generation);
            if current != Some(generation) {
                return;
            }
            state.process = None;
            state.phase = ServerPhase::Stopped;
            (
                std::mem::replace(&mut state.calendar_running, false),
                state.ready_watch.take(),
            )
        };
        if let Some(watch) = ready_watch {
            watch.unsubscribe();
        }

        tracing::info!(?code, "server process exited");
        if was_calendar_running {
            self.calendar_listeners.emit(|listener| listener(false));
        }
        self.output.state_changed(ServerPhase::Stopped);
        self.output.closed(code);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for watch in self.calendar_watches.drain(..) {
            watch.unsubscribe();
        }
    }
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<String>) {
    while let Some(command) = commands.recv().await {
        let written = match stdin.write_all(command.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to write to server stdin");
            break;
        }
    }
}

/// Splits stdout into lines for the bus and forwards each raw chunk.
async fn pump_stdout(
    mut stdout: impl AsyncRead + Unpin,
    bus: LogBus,
    output: Arc<dyn ServerOutput>,
) {
    let mut lines = LineBuffer::default();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                for line in lines.push(chunk) {
                    bus.publish(&line);
                }
                output.stdout(&String::from_utf8_lossy(chunk));
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read server stdout");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        bus.publish(&line);
    }
}

async fn pump_stderr(mut stderr: impl AsyncRead + Unpin, output: Arc<dyn ServerOutput>) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.stderr(&String::from_utf8_lossy(&buf[..n])),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read server stderr");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    mut pumps: [JoinHandle<()>; 2],
    inner: Weak<Inner>,
    generation: u64,
    closed: watch::Sender<bool>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to wait for server process");
            None
        }
    };

    // Let the pumps deliver what the process wrote just before exiting.
    let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
        for pump in pumps.iter_mut() {
            let _ = pump.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("server output still open after exit, abandoning it");
        for pump in &pumps {
            pump.abort();
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.handle_closed(generation, code);
    }
    let _ = closed.send(true);
}
