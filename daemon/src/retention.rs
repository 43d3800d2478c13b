/// Disk budget enforcement for automatically generated backups.
///
/// Only files carrying [`AUTO_BACKUP_PREFIX`] are ever candidates; backups a
/// user asked for by hand are left alone regardless of the budget.
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};

/// Name prefix marking a backup as scheduler-generated.
pub const AUTO_BACKUP_PREFIX: &str = "auto-";

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub name: String,
    pub size_bytes: u64,
    pub modified_at: SystemTime,
}

/// Outcome of a retention pass.  `deleted` is in deletion order (oldest first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
}

impl RetentionPlan {
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.freed_bytes)
    }
}

/// Converts a GiB budget to bytes.  Negative or NaN budgets become 0.
pub fn gib_to_bytes(gib: f64) -> u64 {
    // `as` saturates: NaN and negatives map to 0, +inf to u64::MAX.
    (gib * BYTES_PER_GIB) as u64
}

/// Decides which files to delete so the rest fits in `budget_bytes`.
///
/// Oldest files go first.  The most recent file always survives, even when
/// it alone is larger than the budget.
pub fn plan_retention(files: &[BackupFile], budget_bytes: u64) -> RetentionPlan {
    let total_bytes = files.iter().map(|f| f.size_bytes).sum::<u64>();
    let mut plan = RetentionPlan {
        total_bytes,
        budget_bytes,
        ..RetentionPlan::default()
    };
    if total_bytes <= budget_bytes {
        return plan;
    }

    let mut candidates: Vec<&BackupFile> = files.iter().collect();
    // Stable: files with identical timestamps keep their input order.
    candidates.sort_by_key(|f| f.modified_at);

    let excess = total_bytes - budget_bytes;
    let mut remaining = candidates.len();
    for file in candidates {
        if plan.freed_bytes >= excess || remaining <= 1 {
            break;
        }
        plan.freed_bytes += file.size_bytes;
        plan.deleted.push(file.name.clone());
        remaining -= 1;
    }
    plan
}

/// Lists regular files in `dir` whose name starts with `prefix`, sorted by name.
/// Creates `dir` if it does not exist yet.
pub fn scan_backups(dir: &Path, prefix: &str) -> Result<Vec<BackupFile>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create backup directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read backup directory {}", dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(prefix) {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if !metadata.is_file() {
            continue;
        }
        files.push(BackupFile {
            name,
            size_bytes: metadata.len(),
            modified_at: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Scans `dir`, plans and performs deletions.  A file that fails to delete is
/// logged and dropped from the returned plan; the pass carries on.
pub fn apply_retention(dir: &Path, prefix: &str, budget_bytes: u64) -> Result<RetentionPlan> {
    let files = scan_backups(dir, prefix)?;
    let mut plan = plan_retention(&files, budget_bytes);

    tracing::info!(
        total_mb = %format!("{:.2}", plan.total_bytes as f64 / BYTES_PER_MB),
        budget_mb = %format!("{:.2}", plan.budget_bytes as f64 / BYTES_PER_MB),
        files = files.len(),
        "checking backup retention"
    );
    if plan.deleted.is_empty() {
        return Ok(plan);
    }

    let mut deleted = Vec::with_capacity(plan.deleted.len());
    let mut freed = 0;
    for name in &plan.deleted {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                let size = files
                    .iter()
                    .find(|f| &f.name == name)
                    .map_or(0, |f| f.size_bytes);
                tracing::info!(file = %name, size_mb = %format!("{:.2}", size as f64 / BYTES_PER_MB), "deleted old backup");
                freed += size;
                deleted.push(name.clone());
            }
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to delete old backup"),
        }
    }
    plan.deleted = deleted;
    plan.freed_bytes = freed;

    tracing::info!(
        freed_mb = %format!("{:.2}", plan.freed_bytes as f64 / BYTES_PER_MB),
        remaining_mb = %format!("{:.2}", plan.remaining_bytes() as f64 / BYTES_PER_MB),
        "backup retention finished"
    );
    if plan.remaining_bytes() > plan.budget_bytes {
        tracing::warn!("newest backup alone exceeds the configured budget");
    }
    Ok(plan)
}
