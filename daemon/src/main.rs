mod config;
mod console;
mod error;
mod event;
mod log_bus;
mod message;
mod output;
mod paths;
mod retention;
mod runtime;
mod scheduler;
mod status;
mod subscription;
mod supervisor;
#[cfg(test)]
mod testing;
mod watcher;

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ConfigStore;
use crate::console::ConsoleCommand;
use crate::event::DaemonEvent;
use crate::output::ConsoleOutput;
use crate::scheduler::BackupScheduler;
use crate::status::{ServerPhase, ServerStatus};
use crate::supervisor::Server;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // stdout carries the server console; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    // ── App data directory ────────────────────────────────────────────────────
    let app_dir = match paths::app_data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = %e, "cannot determine app data directory");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&app_dir) {
        tracing::error!(dir = %app_dir.display(), error = %e, "failed to create app data directory");
        std::process::exit(1);
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path(&app_dir);
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        tracing::error!(error = %e, "config error, using defaults");
        config::Config::default()
    });
    let store = ConfigStore::new(config_path.clone(), initial_config);

    // ── Initial status ────────────────────────────────────────────────────────
    let status_path = paths::status_file_path(&app_dir);
    let mut current_status = ServerStatus::new();
    status::write_status(&status_path, &current_status);

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);

    // ── Server and scheduler ──────────────────────────────────────────────────
    let server = Server::new(store.clone(), Arc::new(ConsoleOutput::new(event_tx.clone())));
    let scheduler = BackupScheduler::new(server.clone());
    let _calendar = {
        let tx = event_tx.clone();
        server.add_calendar_listener(move |running| {
            let _ = tx.try_send(DaemonEvent::CalendarChanged(running));
        })
    };

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path.clone(), event_tx.clone()));
    tokio::spawn(console::run(event_tx.clone()));

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "vssm-daemon started, type `help` for commands"
    );
    let issues = server.validate();
    if !issues.is_empty() {
        let issues = issues.iter().map(ToString::to_string).collect::<Vec<_>>();
        tracing::warn!(issues = %issues.join(", "), "server cannot be started yet");
    }

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::ConfigReloaded(new_config) => {
                if store.replace(new_config) {
                    tracing::info!("config reloaded");
                }
            }

            DaemonEvent::Console(ConsoleCommand::Start) => match server.start() {
                Ok(()) => {
                    current_status.error = None;
                    status::write_status(&status_path, &current_status);
                }
                Err(e) => tracing::error!(error = %e, "failed to start server"),
            },

            DaemonEvent::Console(ConsoleCommand::Stop) => {
                let server = server.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.stop().await {
                        report_failure(&tx, "stop", e.to_string()).await;
                    }
                });
            }

            DaemonEvent::Console(ConsoleCommand::Backup) => {
                let server = server.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = server.generate_backup("").await {
                        report_failure(&tx, "backup", e.to_string()).await;
                    }
                });
            }

            DaemonEvent::Console(ConsoleCommand::Runtime(path)) => {
                let store = store.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    let version = match runtime::validate_executable(&path).await {
                        Ok(version) => version,
                        Err(e) => return report_failure(&tx, "runtime", e.to_string()).await,
                    };
                    match store.update(|c| c.runtime_path = Some(path.clone())) {
                        Ok(_) => tracing::info!(path = %path.display(), %version, "runtime saved"),
                        Err(e) => report_failure(&tx, "runtime", format!("{e:#}")).await,
                    }
                });
            }

            DaemonEvent::Console(ConsoleCommand::Status) => {
                println!(
                    "server: {:?} (pid {})",
                    server.phase(),
                    server.pid().map_or_else(|| "-".to_string(), |p| p.to_string())
                );
                println!("calendar running: {}", server.is_calendar_running());
                match (scheduler.job_rule(), scheduler.next_run()) {
                    (Some(rule), Some(next)) => println!("backup job: {rule} (next {next})"),
                    (Some(rule), None) => println!("backup job: {rule}"),
                    _ => println!("backup job: none"),
                }
                if let Some(name) = &current_status.last_backup {
                    println!("last backup: {name}");
                }
                if let Some(error) = &current_status.error {
                    println!("last error: {error}");
                }
            }

            DaemonEvent::Console(ConsoleCommand::Help) => println!("{}", console::HELP),

            DaemonEvent::Console(ConsoleCommand::Server(command)) => {
                if !server.is_running() {
                    println!("server is not running");
                }
                server.send_command(&command);
            }

            DaemonEvent::CalendarChanged(running) => {
                current_status.calendar_running = running;
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::ServerStateChanged(phase) => {
                current_status.state = phase;
                current_status.pid = server.pid();
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::ServerClosed(code) => {
                if code != Some(0) {
                    current_status.error = Some(match code {
                        Some(code) => format!("server exited with code {code}"),
                        None => "server was terminated".to_string(),
                    });
                }
                current_status.state = ServerPhase::Stopped;
                current_status.pid = None;
                current_status.calendar_running = false;
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::BackupCreated(name) => {
                current_status.last_backup = Some(name);
                current_status.last_backup_timestamp = Some(chrono::Local::now().to_rfc3339());
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::OperationFailed { operation, error } => {
                tracing::error!(operation, %error, "operation failed");
                current_status.error = Some(format!("{operation} failed: {error}"));
                status::write_status(&status_path, &current_status);
            }

            DaemonEvent::Console(ConsoleCommand::Quit) | DaemonEvent::Shutdown => {
                tracing::info!("shutting down");
                if server.is_running() {
                    if let Err(e) = server.stop().await {
                        tracing::error!(error = %e, "failed to stop server cleanly");
                    }
                }
                scheduler.cancel_job();
                current_status.state = ServerPhase::Stopped;
                current_status.pid = None;
                current_status.calendar_running = false;
                status::write_status(&status_path, &current_status);
                break;
            }
        }
    }
}

async fn report_failure(tx: &mpsc::Sender<DaemonEvent>, operation: &'static str, error: String) {
    let _ = tx.send(DaemonEvent::OperationFailed { operation, error }).await;
}
