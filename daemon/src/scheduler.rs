/// Periodic automatic backups while players are online.
///
/// At most one job exists.  It is created when the game calendar starts
/// running (players connected) and cancelled when it pauses, so an idle
/// world is not backed up over and over.  Each firing asks the server for an
/// `auto-` backup and then trims old automatic backups to the configured
/// budget.
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::{Config, ConfigStore};
use crate::retention::{self, AUTO_BACKUP_PREFIX};
use crate::subscription::{lock, Subscription};
use crate::supervisor::Server;

/// Accepts standard 5-field cron (`m h dom mon dow`) by prepending seconds=0
/// and renumbering the day-of-week field.  Rules with 6 or 7 fields use the
/// `cron` crate's own syntax and pass through unchanged.
pub fn normalize_rule(rule: &str) -> String {
    let rule = rule.trim();
    let mut fields: Vec<String> = rule.split_whitespace().map(str::to_string).collect();
    if fields.len() != 5 {
        return rule.to_string();
    }
    // Left as-is when malformed; the parser reports it.
    if let Some(dow) = translate_day_of_week(&fields[4]) {
        fields[4] = dow;
    }
    format!("0 {}", fields.join(" "))
}

/// Standard cron numbers weekdays 0-7 from Sunday, with 7 also Sunday.  The
/// `cron` crate numbers them 1-7 from Sunday.  Numeric items (points, ranges,
/// steps) are expanded into an explicit crate-numbered list; named items pass
/// through.
fn translate_day_of_week(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_string());
    }

    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((start, end)) => (start.parse::<u32>().ok()?, end.parse::<u32>().ok()?),
            // `n/step` runs from n to the end of the week.
            None if item.contains('/') => (range.parse::<u32>().ok()?, 7),
            None => {
                let day = range.parse::<u32>().ok()?;
                (day, day)
            }
        };
        if start > end || end > 7 {
            return None;
        }
        days.extend((start..=end).step_by(step).map(|day| day % 7 + 1));
    }

    let items: Vec<String> = days.iter().map(u32::to_string).chain(named).collect();
    Some(items.join(","))
}

pub fn parse_rule(rule: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(&normalize_rule(rule))
}

struct BackupJob {
    rule: String,
    schedule: Schedule,
    /// Set to `true` (or dropped) to stop future firings.
    stop_tx: watch::Sender<bool>,
}

pub struct BackupScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    server: Server,
    config: ConfigStore,
    runtime: Handle,
    job: Mutex<Option<BackupJob>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl BackupScheduler {
    /// Hooks the scheduler to the server's calendar and to config changes.
    /// Must be called from within a tokio runtime.
    pub fn new(server: Server) -> Self {
        let config = server.config().clone();
        let inner = Arc::new(SchedulerInner {
            server,
            config,
            runtime: Handle::current(),
            job: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let calendar = inner.server.add_calendar_listener(move |running| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_calendar_changed(running);
            }
        });
        let weak = Arc::downgrade(&inner);
        let config = inner.config.subscribe(move |config| {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.on_config_changed(config);
            }
        });
        lock(&inner.subscriptions).extend([calendar, config]);

        // The calendar may already be running when the scheduler is attached.
        if inner.server.is_calendar_running() {
            inner.on_calendar_changed(true);
        }
        Self { inner }
    }

    pub fn on_calendar_changed(&self, running: bool) {
        self.inner.on_calendar_changed(running);
    }

    pub fn on_config_changed(&self, config: &Config) {
        self.inner.on_config_changed(config);
    }

    /// Stops future firings.  Safe to call when no job exists.
    pub fn cancel_job(&self) {
        self.inner.cancel_job();
    }

    pub fn has_job(&self) -> bool {
        lock(&self.inner.job).is_some()
    }

    pub fn job_rule(&self) -> Option<String> {
        lock(&self.inner.job).as_ref().map(|job| job.rule.clone())
    }

    pub fn next_run(&self) -> Option<DateTime<Local>> {
        lock(&self.inner.job)
            .as_ref()
            .and_then(|job| job.schedule.upcoming(Local).next())
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        for subscription in lock(&self.inner.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        self.inner.cancel_job();
    }
}

impl SchedulerInner {
    fn on_calendar_changed(&self, running: bool) {
        if !running {
            self.cancel_job();
            return;
        }
        if lock(&self.job).is_some() {
            return;
        }
        let config = self.config.get();
        if config.periodic_backup.enabled {
            self.create_job(&config);
        }
    }

    fn on_config_changed(&self, config: &Config) {
        if !config.periodic_backup.enabled || !self.server.is_calendar_running() {
            self.cancel_job();
            return;
        }

        enforce_retention(config);

        if lock(&self.job).is_some() {
            self.reschedule(config);
        } else {
            self.create_job(config);
        }
    }

    fn create_job(&self, config: &Config) {
        let Some(rule) = config.periodic_backup.rule() else {
            tracing::warn!("periodic backups are enabled but no rule is configured");
            return;
        };
        let schedule = match parse_rule(rule) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(rule, error = %e, "invalid backup rule, no job scheduled");
                return;
            }
        };

        let mut job = lock(&self.job);
        if let Some(old) = job.take() {
            let _ = old.stop_tx.send(true);
        }
        *job = Some(self.spawn_job(rule, schedule));
        tracing::info!(rule, "scheduled backup job");
    }

    fn reschedule(&self, config: &Config) {
        let Some(rule) = config.periodic_backup.rule() else {
            tracing::warn!("backup rule removed, keeping the current schedule");
            return;
        };
        if lock(&self.job).as_ref().is_some_and(|job| job.rule == rule) {
            return;
        }
        let schedule = match parse_rule(rule) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!(rule, error = %e, "invalid backup rule, keeping the current schedule");
                return;
            }
        };

        let mut job = lock(&self.job);
        if let Some(old) = job.take() {
            let _ = old.stop_tx.send(true);
        }
        *job = Some(self.spawn_job(rule, schedule));
        tracing::info!(rule, "rescheduled backup job");
    }

    fn spawn_job(&self, rule: &str, schedule: Schedule) -> BackupJob {
        let (stop_tx, stop_rx) = watch::channel(false);
        if let Some(next) = schedule.upcoming(Local).next() {
            tracing::info!(next = %next, "next backup");
        }
        self.runtime.spawn(run_job(
            self.server.clone(),
            self.config.clone(),
            schedule.clone(),
            stop_rx,
        ));
        BackupJob {
            rule: rule.to_string(),
            schedule,
            stop_tx,
        }
    }

    fn cancel_job(&self) {
        if let Some(job) = lock(&self.job).take() {
            let _ = job.stop_tx.send(true);
            tracing::info!("cancelled backup job");
        }
    }
}

/// Fires on every occurrence of `schedule` until stopped.  A backup already
/// in progress when the job is stopped runs to completion.
async fn run_job(
    server: Server,
    config: ConfigStore,
    schedule: Schedule,
    mut stop: watch::Receiver<bool>,
) {
    let mut after = Local::now();
    loop {
        let Some(next) = schedule.after(&after).next() else {
            tracing::info!("backup rule has no further occurrences");
            return;
        };
        let delay = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            // Also resolves if the job was dropped.
            _ = stop.wait_for(|stopped| *stopped) => return,
            _ = tokio::time::sleep(delay) => {}
        }
        after = next;

        match server.generate_backup(AUTO_BACKUP_PREFIX).await {
            Ok(name) => {
                tracing::info!(file = %name, "backup created");
                enforce_retention(&config.get());
            }
            // The job stays scheduled; the next occurrence simply tries again.
            Err(e) => tracing::warn!(error = %e, "scheduled backup failed"),
        }
        if let Some(next) = schedule.after(&after).next() {
            tracing::info!(next = %next, "next backup");
        }
    }
}

/// Trims automatic backups to the configured budget.
pub fn enforce_retention(config: &Config) {
    let Some(dir) = config.backups_dir() else {
        return;
    };
    let budget = retention::gib_to_bytes(config.periodic_backup.max_buffer_size_in_gb);
    if let Err(e) = retention::apply_retention(&dir, AUTO_BACKUP_PREFIX, budget) {
        tracing::error!(dir = %dir.display(), error = %e, "backup retention failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{CALENDAR_PAUSED_TEXT, CALENDAR_RESUMED_TEXT};
    use crate::testing::RecordingOutput;

    const HOURLY: &str = "0 * * * *";

    fn notification(text: &str) -> String {
        format!("1.2.2025 08:00:00 [Server Notification] {text}")
    }

    fn enabled_config(rule: &str) -> Config {
        let mut config = Config::default();
        config.periodic_backup.enabled = true;
        config.periodic_backup.rule = Some(rule.to_string());
        config
    }

    fn setup(config: Config) -> (Server, BackupScheduler) {
        let server = Server::new(
            ConfigStore::in_memory(config),
            Arc::new(RecordingOutput::default()),
        );
        let scheduler = BackupScheduler::new(server.clone());
        (server, scheduler)
    }

    fn resume(server: &Server) {
        server.logs().publish(&notification(CALENDAR_RESUMED_TEXT));
    }

    fn pause(server: &Server) {
        server.logs().publish(&notification(CALENDAR_PAUSED_TEXT));
    }

    // ── rules ─────────────────────────────────────────────────────────────────

    #[test]
    fn five_field_rules_get_a_seconds_field() {
        assert_eq!(normalize_rule("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_rule(" 0 3 * * Mon "), "0 0 3 * * Mon");
        assert_eq!(normalize_rule("30 0 3 * * *"), "30 0 3 * * *");
    }

    #[test]
    fn five_field_weekdays_use_standard_numbering() {
        assert_eq!(normalize_rule("0 3 * * 1"), "0 0 3 * * 2");
        assert_eq!(normalize_rule("0 3 * * 0"), "0 0 3 * * 1");
        assert_eq!(normalize_rule("0 3 * * 7"), "0 0 3 * * 1");
        assert_eq!(normalize_rule("0 3 * * 1-5"), "0 0 3 * * 2,3,4,5,6");
        assert_eq!(normalize_rule("0 3 * * 5-7"), "0 0 3 * * 1,6,7");
        assert_eq!(normalize_rule("0 3 * * 0,6"), "0 0 3 * * 1,7");
        assert_eq!(normalize_rule("0 3 * * */2"), "0 0 3 * * 1,3,5,7");
        assert_eq!(normalize_rule("0 3 * * 1/3"), "0 0 3 * * 1,2,5");
        assert_eq!(normalize_rule("0 3 * * 1,Sat"), "0 0 3 * * 2,Sat");
    }

    #[test]
    fn malformed_weekday_field_is_left_for_the_parser() {
        assert_eq!(normalize_rule("0 3 * * 5-2"), "0 0 3 * * 5-2");
        assert_eq!(normalize_rule("0 3 * * 8"), "0 0 3 * * 8");
        assert!(parse_rule("0 3 * * 5-2").is_err());
        assert!(parse_rule("0 3 * * 8").is_err());
        assert!(parse_rule("0 3 * * 1/0").is_err());
    }

    #[test]
    fn five_field_rules_fire_on_the_named_weekday() {
        use chrono::{Datelike, Timelike, Weekday};

        let next = |rule: &str| parse_rule(rule).unwrap().upcoming(Local).next().unwrap();

        let monday = next("0 3 * * 1");
        assert_eq!(monday.weekday(), Weekday::Mon);
        assert_eq!(monday.hour(), 3);
        assert_eq!(next("0 3 * * 0").weekday(), Weekday::Sun);
        assert_eq!(next("0 3 * * 7").weekday(), Weekday::Sun);

        let weekdays = parse_rule("0 3 * * 1-5").unwrap();
        for run in weekdays.upcoming(Local).take(10) {
            assert!(!matches!(run.weekday(), Weekday::Sat | Weekday::Sun), "fired on {run}");
        }
    }

    #[test]
    fn parse_rule_accepts_standard_and_extended_forms() {
        assert!(parse_rule("0 */6 * * *").is_ok());
        assert!(parse_rule("0 0 */6 * * *").is_ok());
        assert!(parse_rule("0 0 3 * * * 2030").is_ok());
        assert!(parse_rule("not a rule").is_err());
        assert!(parse_rule("").is_err());
    }

    // ── calendar ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn job_follows_calendar_state() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        assert!(!scheduler.has_job());

        resume(&server);
        assert!(scheduler.has_job());
        assert_eq!(scheduler.job_rule().as_deref(), Some(HOURLY));
        assert!(scheduler.next_run().is_some());

        pause(&server);
        assert!(!scheduler.has_job());
    }

    #[tokio::test]
    async fn disabled_backups_never_schedule() {
        let mut config = enabled_config(HOURLY);
        config.periodic_backup.enabled = false;
        let (server, scheduler) = setup(config);

        resume(&server);
        assert!(!scheduler.has_job());
    }

    #[tokio::test]
    async fn missing_or_invalid_rule_schedules_nothing() {
        let mut config = enabled_config(HOURLY);
        config.periodic_backup.rule = None;
        let (server, scheduler) = setup(config);
        resume(&server);
        assert!(!scheduler.has_job());

        let (server, scheduler) = setup(enabled_config("every full moon"));
        resume(&server);
        assert!(!scheduler.has_job());
    }

    #[tokio::test]
    async fn repeated_resume_keeps_the_job() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        resume(&server);
        resume(&server);
        assert_eq!(scheduler.job_rule().as_deref(), Some(HOURLY));
    }

    #[tokio::test]
    async fn scheduler_attached_while_calendar_runs_creates_job() {
        let server = Server::new(
            ConfigStore::in_memory(enabled_config(HOURLY)),
            Arc::new(RecordingOutput::default()),
        );
        resume(&server);
        let scheduler = BackupScheduler::new(server.clone());
        assert!(scheduler.has_job());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        resume(&server);
        scheduler.cancel_job();
        scheduler.cancel_job();
        assert!(!scheduler.has_job());
    }

    // ── config changes ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn config_change_reschedules_existing_job() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        resume(&server);

        server
            .config()
            .update(|c| c.periodic_backup.rule = Some("*/5 * * * *".to_string()))
            .unwrap();
        assert_eq!(scheduler.job_rule().as_deref(), Some("*/5 * * * *"));
    }

    #[tokio::test]
    async fn invalid_rule_change_keeps_existing_job() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        resume(&server);

        server
            .config()
            .update(|c| c.periodic_backup.rule = Some("bogus".to_string()))
            .unwrap();
        assert_eq!(scheduler.job_rule().as_deref(), Some(HOURLY));
    }

    #[tokio::test]
    async fn disabling_cancels_and_enabling_creates() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        resume(&server);

        server.config().update(|c| c.periodic_backup.enabled = false).unwrap();
        assert!(!scheduler.has_job());

        server.config().update(|c| c.periodic_backup.enabled = true).unwrap();
        assert!(scheduler.has_job());
    }

    #[tokio::test]
    async fn config_change_while_paused_schedules_nothing() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        server.config().update(|c| c.port = Some(1)).unwrap();
        assert!(!scheduler.has_job());
    }

    #[tokio::test]
    async fn config_change_applies_retention_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("Backups");
        std::fs::create_dir(&backups).unwrap();
        for name in ["auto-a.vcdbs", "auto-b.vcdbs", "manual.vcdbs"] {
            std::fs::write(backups.join(name), vec![0u8; 1024]).unwrap();
        }
        let mut config = enabled_config(HOURLY);
        config.server_data_path = Some(dir.path().to_path_buf());
        let (server, _scheduler) = setup(config);
        resume(&server);

        server
            .config()
            .update(|c| c.periodic_backup.max_buffer_size_in_gb = 0.0)
            .unwrap();

        assert!(!backups.join("auto-a.vcdbs").exists());
        assert!(backups.join("auto-b.vcdbs").exists());
        assert!(backups.join("manual.vcdbs").exists());
    }

    #[tokio::test]
    async fn dropped_scheduler_stops_reacting() {
        let (server, scheduler) = setup(enabled_config(HOURLY));
        drop(scheduler);
        // Nothing is listening any more; this must not panic or schedule.
        resume(&server);
        pause(&server);
    }

    // ── firing ────────────────────────────────────────────────────────────────

    #[cfg(unix)]
    mod firing {
        use super::*;
        use crate::status::ServerPhase;
        use crate::testing::{wait_until, FakeServer};

        fn auto_backups(fake: &FakeServer) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(fake.backups())
                .map(|entries| {
                    entries
                        .filter_map(Result::ok)
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .filter(|n| n.starts_with(AUTO_BACKUP_PREFIX))
                        .collect()
                })
                .unwrap_or_default();
            names.sort();
            names
        }

        #[tokio::test]
        async fn firing_backs_up_and_trims_old_backups() {
            let mut fake = FakeServer::new();
            fake.config.periodic_backup = enabled_config("* * * * * *").periodic_backup;
            fake.config.periodic_backup.max_buffer_size_in_gb = 0.0;
            std::fs::create_dir_all(fake.backups()).unwrap();
            for name in ["auto-old-1.vcdbs", "auto-old-2.vcdbs"] {
                std::fs::write(fake.backups().join(name), vec![0u8; 100]).unwrap();
            }

            let server = Server::new(
                ConfigStore::in_memory(fake.config.clone()),
                Arc::new(RecordingOutput::default()),
            );
            let scheduler = BackupScheduler::new(server.clone());
            server.start().unwrap();
            wait_until(|| server.phase() == ServerPhase::Running).await;
            server.send_command("join");
            wait_until(|| scheduler.has_job()).await;

            wait_until(|| {
                let names = auto_backups(&fake);
                !names.contains(&"auto-old-2.vcdbs".to_string())
            })
            .await;

            let names = auto_backups(&fake);
            assert!(!names.contains(&"auto-old-1.vcdbs".to_string()));
            assert!(names.iter().any(|n| n.starts_with("auto-vssm-")));
            // The fake server pauses the calendar while backing up.
            assert!(!scheduler.has_job());
            server.stop().await.unwrap();
        }

        #[tokio::test]
        async fn failed_backup_keeps_the_job() {
            let fake = FakeServer::new();
            std::fs::write(fake.data().join("silent"), b"").unwrap();
            let mut config = fake.config.clone();
            config.periodic_backup = enabled_config("* * * * * *").periodic_backup;
            let server = Server::with_watcher(
                ConfigStore::in_memory(config),
                Arc::new(RecordingOutput::default()),
                crate::watcher::LogWatcher::with_timeouts(
                    crate::log_bus::LogBus::new(),
                    Duration::from_millis(100),
                    Duration::from_millis(100),
                ),
            );
            let scheduler = BackupScheduler::new(server.clone());
            server.start().unwrap();
            server.send_command("join");
            wait_until(|| scheduler.has_job()).await;

            wait_until(|| {
                fake.commands()
                    .iter()
                    .filter(|c| c.starts_with("/genbackup"))
                    .count()
                    >= 2
            })
            .await;
            assert!(scheduler.has_job());
            server.stop().await.unwrap();
        }
    }
}
