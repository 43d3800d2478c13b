/// Console rendition of the supervisor's outward events.
///
/// Server stdout is echoed to the daemon's stdout unchanged; everything
/// else becomes a [`DaemonEvent`] for the main loop.
use std::io::Write;

use tokio::sync::mpsc;

use crate::event::DaemonEvent;
use crate::status::ServerPhase;
use crate::supervisor::ServerOutput;

pub struct ConsoleOutput {
    tx: mpsc::Sender<DaemonEvent>,
}

impl ConsoleOutput {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self { tx }
    }

    /// Non-blocking: if the event loop is backed up the event is dropped.
    fn notify(&self, event: DaemonEvent) {
        if self.tx.try_send(event).is_err() {
            tracing::warn!("event channel full or closed, dropping server event");
        }
    }
}

impl ServerOutput for ConsoleOutput {
    fn stdout(&self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }

    fn stderr(&self, chunk: &str) {
        for line in chunk.lines().filter(|l| !l.trim().is_empty()) {
            tracing::warn!(target: "server", "{line}");
        }
    }

    fn closed(&self, code: Option<i32>) {
        self.notify(DaemonEvent::ServerClosed(code));
    }

    fn state_changed(&self, phase: ServerPhase) {
        self.notify(DaemonEvent::ServerStateChanged(phase));
    }

    fn backup_created(&self, name: &str) {
        self.notify(DaemonEvent::BackupCreated(name.to_string()));
    }
}
