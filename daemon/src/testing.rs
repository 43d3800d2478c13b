/// Fixtures shared by the process-level unit tests.
use std::sync::Mutex;
use std::time::Duration;

use crate::status::ServerPhase;
use crate::supervisor::ServerOutput;

#[derive(Default)]
pub struct RecordingOutput {
    pub stdout: Mutex<String>,
    pub stderr: Mutex<String>,
    pub closed: Mutex<Vec<Option<i32>>>,
    pub phases: Mutex<Vec<ServerPhase>>,
    pub backups: Mutex<Vec<String>>,
}

impl ServerOutput for RecordingOutput {
    fn stdout(&self, chunk: &str) {
        self.stdout.lock().unwrap().push_str(chunk);
    }
    fn stderr(&self, chunk: &str) {
        self.stderr.lock().unwrap().push_str(chunk);
    }
    fn closed(&self, code: Option<i32>) {
        self.closed.lock().unwrap().push(code);
    }
    fn state_changed(&self, phase: ServerPhase) {
        self.phases.lock().unwrap().push(phase);
    }
    fn backup_created(&self, name: &str) {
        self.backups.lock().unwrap().push(name.to_string());
    }
}

/// Polls `condition` every 10ms, panicking after 10s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[cfg(unix)]
pub use fake_server::FakeServer;

#[cfg(unix)]
mod fake_server {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use crate::config::Config;

    /// Stands in for the game server.  Configured as the runtime, so its
    /// arguments are `<executable> --dataPath <data> --port <port>`.
    ///
    /// Commands: `/stop`, `/genbackup <name>` (writes `Backups/<name>` unless
    /// `<data>/silent` exists), `join` (resume line), `crash` (exit 3).
    const SCRIPT: &str = r#"#!/bin/sh
data="$3"
note() { echo "1.2.2025 08:00:00 [Server Notification] $1"; }
echo "Loading world..."
echo "1.2.2025 08:00:00 [Server Event] Dedicated Server now running on Port $5 and all ips!"
while IFS= read -r line; do
  line=$(printf '%s' "$line" | tr -d '\r')
  printf '%s\n' "$line" >> "$data/commands.log"
  case "$line" in
    /stop)
      echo "1.2.2025 08:00:05 [Server Event] Shutting down"
      exit 0 ;;
    "/genbackup "*)
      if [ ! -e "$data/silent" ]; then
        note "All clients disconnected, pausing game calendar."
        note "Ok, generating backup, this might take a while"
        mkdir -p "$data/Backups"
        : > "$data/Backups/${line#/genbackup }"
        note "Backup complete!"
      fi ;;
    join) note "A client reconnected, resuming game calendar." ;;
    crash) echo "fatal" >&2; exit 3 ;;
  esac
done
"#;

    pub struct FakeServer {
        dir: tempfile::TempDir,
        pub config: Config,
    }

    impl FakeServer {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let runtime = dir.path().join("fake-runtime");
            std::fs::write(&runtime, SCRIPT).unwrap();
            std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
            let data = dir.path().join("data");
            std::fs::create_dir(&data).unwrap();
            let config = Config {
                runtime_path: Some(runtime),
                server_executable_path: Some(dir.path().join("VintagestoryServer.dll")),
                server_data_path: Some(data),
                port: Some(42421),
                ..Config::default()
            };
            Self { dir, config }
        }

        pub fn data(&self) -> PathBuf {
            self.dir.path().join("data")
        }

        pub fn backups(&self) -> PathBuf {
            self.data().join("Backups")
        }

        /// Every command line the server received, CR stripped.
        pub fn commands(&self) -> Vec<String> {
            std::fs::read_to_string(self.data().join("commands.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }
}
