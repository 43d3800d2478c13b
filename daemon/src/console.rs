/// Line-oriented control console on the daemon's own stdin.
///
/// Each line is either a daemon command (`start`, `stop`, `backup`, ...) or,
/// when it begins with `/`, a command passed straight to the game server.
use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

pub const HELP: &str = "\
commands:
  start            start the server
  stop             stop the server (backs up first if configured)
  backup           create a manual backup
  status           show server and backup schedule state
  runtime <path>   validate and save the dotnet runtime to use
  quit             stop the server and exit
  /<command>       send a command to the server console";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Start,
    Stop,
    Backup,
    Status,
    Runtime(PathBuf),
    Help,
    Quit,
    /// Sent to the server's stdin verbatim.
    Server(String),
}

/// Parses one console line.  Daemon command names are case-insensitive.
///
/// Returns `None` for blank lines and anything unrecognised.
pub fn parse_command(line: &str) -> Option<ConsoleCommand> {
    let line = line.trim();
    if line.starts_with('/') {
        return (line.len() > 1).then(|| ConsoleCommand::Server(line.to_string()));
    }

    let (name, argument) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    match (name.to_lowercase().as_str(), argument) {
        ("start", "") => Some(ConsoleCommand::Start),
        ("stop", "") => Some(ConsoleCommand::Stop),
        ("backup", "") => Some(ConsoleCommand::Backup),
        ("status", "") => Some(ConsoleCommand::Status),
        ("help" | "?", "") => Some(ConsoleCommand::Help),
        ("quit" | "exit", "") => Some(ConsoleCommand::Quit),
        ("runtime", path) if !path.is_empty() => Some(ConsoleCommand::Runtime(PathBuf::from(path))),
        _ => None,
    }
}

/// Reads stdin until EOF, forwarding each recognised command to `tx`.
/// EOF ends the console but not the daemon, so it can run detached.
pub async fn run(tx: mpsc::Sender<DaemonEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read console input");
                break;
            }
        };
        match parse_command(&line) {
            Some(command) => {
                if tx.send(DaemonEvent::Console(command)).await.is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => println!("unknown command: {}\n{HELP}", line.trim()),
        }
    }
    tracing::debug!("console input closed");
}
