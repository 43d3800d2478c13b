use crate::config::Config;
use crate::console::ConsoleCommand;
use crate::status::ServerPhase;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// A command line was entered on the daemon's console.
    Console(ConsoleCommand),
    /// The in-game calendar paused (`false`) or resumed (`true`).
    CalendarChanged(bool),
    ServerStateChanged(ServerPhase),
    /// The server process exited with the given code (`None` if killed by a signal).
    ServerClosed(Option<i32>),
    /// A backup finished, whoever requested it.
    BackupCreated(String),
    /// A background operation failed; recorded in the status file.
    OperationFailed { operation: &'static str, error: String },
    /// Ctrl+C or `quit`; stop the server and exit.
    Shutdown,
}
