//! Per-path backup lifecycle.
//!
//! Each configured path goes through
//! `schedule check -> archive -> change check -> upload -> commit`, strictly
//! one path at a time. Archive and transfer failures end that path's run and
//! leave it due; the loop moves on. A ledger write failure ends the whole run.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Local};

use crate::archive::ArchivePipeline;
use crate::config::{PathSpec, Settings};
use crate::error::{Error, ErrorKind, Result};
use crate::ledger::{Ledger, LedgerEntry};
use crate::schedule;

mod events;

pub use events::{BackupEvent, ChannelSink, EventSink, Phase, TracingSink, format_bytes};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathOutcome {
    NotDue { reason: &'static str },
    Unchanged,
    Committed { bytes: u64 },
    Failed { phase: Phase, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReport {
    pub path: PathBuf,
    pub target: String,
    pub outcome: PathOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub paths: Vec<PathReport>,
    /// Bytes uploaded during this run, by target.
    pub uploaded: BTreeMap<String, u64>,
    /// Size of the latest stored archive of every configured path, by target.
    pub stored: BTreeMap<String, u64>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| matches!(p.outcome, PathOutcome::Failed { .. }))
            .count()
    }

    pub fn committed(&self) -> usize {
        self.paths
            .iter()
            .filter(|p| matches!(p.outcome, PathOutcome::Committed { .. }))
            .count()
    }
}

pub struct Orchestrator<'a> {
    settings: &'a Settings,
    pipeline: ArchivePipeline,
    sink: &'a dyn EventSink,
}

impl<'a> Orchestrator<'a> {
    pub fn new(settings: &'a Settings, sink: &'a dyn EventSink) -> Self {
        Self {
            settings,
            pipeline: ArchivePipeline::new(settings.pipeline_options()),
            sink,
        }
    }

    /// Processes every configured path in order. Only fatal errors (ledger
    /// writes) are returned; per-path failures are reported in the outcome.
    pub fn run(&self, ledger: &mut Ledger, now: DateTime<Local>) -> Result<RunReport> {
        self.sink.emit(BackupEvent::RunStarted {
            paths: self.settings.paths.len(),
        });

        let mut report = RunReport::default();
        for spec in &self.settings.paths {
            let outcome = self.process(spec, ledger, now)?;
            let target = spec.target.identify();
            if let PathOutcome::Committed { bytes } = outcome {
                *report.uploaded.entry(target.clone()).or_default() += bytes;
            }
            report.paths.push(PathReport {
                path: spec.path.clone(),
                target,
                outcome,
            });
        }
        report.stored = stored_bytes(&self.settings.paths, ledger);

        self.sink.emit(BackupEvent::Summary(report.clone()));
        Ok(report)
    }

    pub fn process(
        &self,
        spec: &PathSpec,
        ledger: &mut Ledger,
        now: DateTime<Local>,
    ) -> Result<PathOutcome> {
        let entry = ledger.get(&spec.identity);
        let last = entry.and_then(|e| e.last_backup).map(|t| t.date_naive());
        let decision = schedule::decide(spec.schedule, last, now.date_naive(), &self.settings.days);
        self.sink.emit(BackupEvent::ScheduleChecked {
            path: spec.path.clone(),
            schedule: spec.schedule,
            due: decision.is_due(),
            reason: decision.reason(),
        });
        if !decision.is_due() {
            return Ok(PathOutcome::NotDue {
                reason: decision.reason(),
            });
        }

        let previous = entry.map(|e| e.content_fingerprint.clone());
        let archive = match self.pipeline.build(spec, previous.as_deref()) {
            Ok(a) => a,
            Err(e) => return self.fail(spec, Phase::Archive, e),
        };
        self.sink.emit(BackupEvent::Archived {
            path: spec.path.clone(),
            bytes: archive.size,
            fingerprint: archive.fingerprint.clone(),
            changed: archive.changed,
        });
        if !archive.changed {
            return Ok(PathOutcome::Unchanged);
        }

        let target = spec.target.identify();
        let remote = self.settings.remote_path(spec);
        if let Err(e) = spec.target.remove(&remote) {
            self.sink.emit(BackupEvent::StaleRemoveFailed {
                path: spec.path.clone(),
                target: target.clone(),
                error: e.to_string(),
            });
        }
        if let Err(e) = spec.target.upload(&archive.path, &self.settings.remote_dir) {
            // The local archive stays for inspection; the next build replaces it.
            return self.fail(spec, Phase::Upload, e.into_kind(ErrorKind::Transfer));
        }
        self.sink.emit(BackupEvent::Uploaded {
            path: spec.path.clone(),
            target,
            remote,
            bytes: archive.size,
        });

        if let Err(e) = fs::remove_file(&archive.path) {
            self.sink.emit(BackupEvent::CleanupFailed {
                path: spec.path.clone(),
                file: archive.path.clone(),
                error: e.to_string(),
            });
        }

        ledger.record(
            spec.identity.clone(),
            LedgerEntry {
                path: spec.path.display().to_string(),
                content_fingerprint: archive.fingerprint,
                last_backup: Some(now),
                archive_size: archive.size,
            },
        );
        ledger.save()?;
        self.sink.emit(BackupEvent::Committed {
            path: spec.path.clone(),
            bytes: archive.size,
        });
        Ok(PathOutcome::Committed {
            bytes: archive.size,
        })
    }

    fn fail(&self, spec: &PathSpec, phase: Phase, err: Error) -> Result<PathOutcome> {
        if err.is_fatal() {
            return Err(err);
        }
        let error = err.to_string();
        self.sink.emit(BackupEvent::PathFailed {
            path: spec.path.clone(),
            phase,
            error: error.clone(),
        });
        Ok(PathOutcome::Failed { phase, error })
    }
}

/// Latest archive size per target, over configured paths with a ledger entry.
pub fn stored_bytes(paths: &[PathSpec], ledger: &Ledger) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for spec in paths {
        if let Some(e) = ledger.get(&spec.identity).filter(|e| e.last_backup.is_some()) {
            *out.entry(spec.target.identify()).or_default() += e.archive_size;
        }
    }
    out
}
