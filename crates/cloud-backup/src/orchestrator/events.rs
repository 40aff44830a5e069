use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc;

use tracing::{error, info, warn};

use super::{PathOutcome, RunReport};
use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Archive,
    Upload,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Archive => "archive",
            Phase::Upload => "upload",
        })
    }
}

#[derive(Debug, Clone)]
pub enum BackupEvent {
    RunStarted {
        paths: usize,
    },
    ScheduleChecked {
        path: PathBuf,
        schedule: Schedule,
        due: bool,
        reason: &'static str,
    },
    Archived {
        path: PathBuf,
        bytes: u64,
        fingerprint: String,
        changed: bool,
    },
    /// Removing the previous remote copy failed; the upload still proceeds.
    StaleRemoveFailed {
        path: PathBuf,
        target: String,
        error: String,
    },
    Uploaded {
        path: PathBuf,
        target: String,
        remote: String,
        bytes: u64,
    },
    CleanupFailed {
        path: PathBuf,
        file: PathBuf,
        error: String,
    },
    Committed {
        path: PathBuf,
        bytes: u64,
    },
    PathFailed {
        path: PathBuf,
        phase: Phase,
        error: String,
    },
    Summary(RunReport),
}

pub trait EventSink: Send + Sync {
    fn emit(&self, ev: BackupEvent);
}

/// Turns events into tracing records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, ev: BackupEvent) {
        match ev {
            BackupEvent::RunStarted { paths } => info!(paths, "backup run started"),
            BackupEvent::ScheduleChecked {
                path,
                schedule,
                due,
                reason,
            } => {
                if due {
                    info!(path = %path.display(), %schedule, reason, "path is due");
                } else {
                    info!(path = %path.display(), %schedule, reason, "not due, skipping");
                }
            }
            BackupEvent::Archived {
                path,
                bytes,
                fingerprint,
                changed,
            } => {
                if changed {
                    info!(
                        path = %path.display(),
                        bytes,
                        size = %format_bytes(bytes),
                        fingerprint = %fingerprint,
                        "content changed, uploading"
                    );
                } else {
                    info!(
                        path = %path.display(),
                        fingerprint = %fingerprint,
                        "content unchanged, skipping upload"
                    );
                }
            }
            BackupEvent::StaleRemoveFailed {
                path,
                target,
                error,
            } => warn!(
                path = %path.display(),
                backend = %target,
                error = %error,
                "failed to remove previous remote archive"
            ),
            BackupEvent::Uploaded {
                path,
                target,
                remote,
                bytes,
            } => info!(
                path = %path.display(),
                backend = %target,
                remote = %remote,
                bytes,
                "uploaded"
            ),
            BackupEvent::CleanupFailed { path, file, error } => warn!(
                path = %path.display(),
                file = %file.display(),
                error = %error,
                "failed to delete local archive"
            ),
            BackupEvent::Committed { path, bytes } => {
                info!(path = %path.display(), bytes, "backup committed")
            }
            BackupEvent::PathFailed { path, phase, error } => {
                error!(path = %path.display(), %phase, error = %error, "backup failed; path stays due")
            }
            BackupEvent::Summary(report) => log_summary(&report),
        }
    }
}

fn log_summary(report: &RunReport) {
    let count = |f: fn(&PathOutcome) -> bool| {
        report.paths.iter().filter(|p| f(&p.outcome)).count()
    };
    info!(
        committed = count(|o| matches!(o, PathOutcome::Committed { .. })),
        unchanged = count(|o| matches!(o, PathOutcome::Unchanged)),
        not_due = count(|o| matches!(o, PathOutcome::NotDue { .. })),
        failed = count(|o| matches!(o, PathOutcome::Failed { .. })),
        "backup run finished"
    );
    for (target, bytes) in &report.uploaded {
        info!(backend = %target, bytes, size = %format_bytes(*bytes), "uploaded this run");
    }
    for (target, bytes) in &report.stored {
        info!(backend = %target, bytes, size = %format_bytes(*bytes), "total backup size");
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<BackupEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<BackupEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, ev: BackupEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Binary units, one decimal: `512B`, `1.5K`, `3.2G`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];
    if bytes < 1024 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let text = format!("{value:.1}");
    let text = text.strip_suffix(".0").unwrap_or(&text);
    format!("{text}{}", UNITS[unit])
}
