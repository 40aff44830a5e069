//! Operator commands that sit beside the backup run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::ArchivePipeline;
use crate::config::Settings;
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::{self, Ledger};
use crate::schedule::{self, Schedule};

/// Deletes the ledger so every path is treated as never backed up.
pub fn reset(settings: &Settings) -> Result<bool> {
    let removed = ledger::reset(&settings.state_file)?;
    if removed {
        info!(ledger = %settings.state_file.display(), "backup state reset");
    } else {
        info!(ledger = %settings.state_file.display(), "no backup state to reset");
    }
    Ok(removed)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

/// Removes every configured path's remote archive. Failures are logged and
/// counted; the remaining paths are still attempted.
pub fn purge(settings: &Settings) -> PurgeReport {
    let mut report = PurgeReport::default();
    for spec in &settings.paths {
        let remote = settings.remote_path(spec);
        match spec.target.remove(&remote) {
            Ok(()) => {
                info!(path = %spec.path.display(), remote = %remote, "remote archive removed");
                report.removed += 1;
            }
            Err(e) => {
                warn!(
                    path = %spec.path.display(),
                    remote = %remote,
                    error = %e,
                    "remote delete failed"
                );
                report.failed += 1;
            }
        }
    }
    report
}

/// Downloads a path's archive and unpacks it under `into` (the working
/// directory when `None`). Returns the restored location.
pub fn restore(settings: &Settings, raw_path: &str, into: Option<&Path>) -> Result<PathBuf> {
    let spec = settings.find_path(raw_path)?;
    fs::create_dir_all(&settings.work_dir).map_err(|e| {
        Error::msg(format!(
            "failed to create working_dir {}: {e}",
            settings.work_dir.display()
        ))
    })?;
    let pipeline = ArchivePipeline::new(settings.pipeline_options());
    let local = pipeline.target_path(spec);
    if local.exists() {
        fs::remove_file(&local)?;
    }

    let remote = settings.remote_path(spec);
    info!(
        path = %spec.path.display(),
        remote = %remote,
        backend = %spec.target.identify(),
        "downloading archive"
    );
    spec.target
        .download(&remote, &local)
        .map_err(|e| e.into_kind(ErrorKind::Transfer))?;

    let dest = into.unwrap_or(settings.work_dir.as_path());
    pipeline.restore(spec, &local, dest)?;
    if let Err(e) = fs::remove_file(&local) {
        warn!(file = %local.display(), error = %e, "failed to delete downloaded archive");
    }

    let restored = match spec.path.file_name() {
        Some(name) => dest.join(name),
        None => dest.to_path_buf(),
    };
    info!(path = %spec.path.display(), restored = %restored.display(), "restored");
    Ok(restored)
}

#[derive(Debug, Clone, Serialize)]
pub struct PathStatus {
    pub path: PathBuf,
    pub identity: String,
    pub schedule: Schedule,
    pub target: String,
    pub last_backup: Option<DateTime<Local>>,
    pub archive_size: u64,
    pub due: bool,
    pub reason: &'static str,
}

/// Read-only view of every configured path against the ledger.
pub fn status(settings: &Settings, ledger: &Ledger, now: DateTime<Local>) -> Vec<PathStatus> {
    settings
        .paths
        .iter()
        .map(|spec| {
            let entry = ledger.get(&spec.identity);
            let last_backup = entry.and_then(|e| e.last_backup);
            let decision = schedule::decide(
                spec.schedule,
                last_backup.map(|t| t.date_naive()),
                now.date_naive(),
                &settings.days,
            );
            PathStatus {
                path: spec.path.clone(),
                identity: spec.identity.clone(),
                schedule: spec.schedule,
                target: spec.target.identify(),
                last_backup,
                archive_size: entry.map(|e| e.archive_size).unwrap_or_default(),
                due: decision.is_due(),
                reason: decision.reason(),
            }
        })
        .collect()
}
