use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, mpsc};

use chrono::{Local, TimeZone};

use cloud_backup::archive::ChangeDetection;
use cloud_backup::config::{PathSpec, Settings};
use cloud_backup::ledger::Ledger;
use cloud_backup::orchestrator::{BackupEvent, ChannelSink, Orchestrator, PathOutcome, Phase};
use cloud_backup::remote::{DirTarget, DirTargetConfig, RemoteTarget, SharedTarget, TargetRegistry};
use cloud_backup::schedule::{AllowedDays, Schedule};
use cloud_backup::{Error, ErrorKind, Result};

fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Records calls and optionally fails uploads.
#[derive(Debug, Default)]
struct RecordingTarget {
    fail_uploads: bool,
    calls: Mutex<Vec<String>>,
}

impl RecordingTarget {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

impl RemoteTarget for RecordingTarget {
    fn identify(&self) -> String {
        "command:recording".into()
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        self.calls.lock().expect("calls").push(format!("remove {remote_path}"));
        Ok(())
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let name = local.file_name().and_then(|s| s.to_str()).unwrap_or_default();
        self.calls
            .lock()
            .expect("calls")
            .push(format!("upload {name} -> {remote_prefix}"));
        if self.fail_uploads {
            return Err(Error::transfer("remote refused the upload"));
        }
        Ok(())
    }

    fn download(&self, _remote_path: &str, _local: &Path) -> Result<()> {
        Err(Error::transfer("not supported"))
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    work: PathBuf,
    state: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().canonicalize().expect("canonical");
        let work = root.join("work");
        fs::create_dir_all(&work).expect("mkdir work");
        Self {
            state: root.join("state.csv"),
            _tmp: tmp,
            root,
            work,
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir).expect("mkdir source");
        fs::write(dir.join("file.txt"), format!("{name} contents\n")).expect("write source");
        dir
    }

    fn spec(&self, path: PathBuf, schedule: Schedule, target: SharedTarget) -> PathSpec {
        let mut spec = PathSpec::new(path, target);
        spec.schedule = schedule;
        spec.compression = false;
        spec
    }

    fn settings(&self, paths: Vec<PathSpec>) -> Settings {
        Settings {
            config_path: self.root.join("cloud-backup.toml"),
            work_dir: self.work.clone(),
            state_file: self.state.clone(),
            passphrase: None,
            compression_level: 2,
            days: AllowedDays::default(),
            remote_dir: "backups/".into(),
            change_detection: ChangeDetection::Archive,
            paths,
            targets: TargetRegistry::default(),
        }
    }
}

fn run_at(settings: &Settings, day: u32) -> (cloud_backup::orchestrator::RunReport, Vec<BackupEvent>) {
    let (tx, rx) = mpsc::channel();
    let sink = ChannelSink::new(tx);
    let now = Local
        .with_ymd_and_hms(2026, 10, day, 9, 0, 0)
        .single()
        .expect("local time");
    let mut ledger = Ledger::load(&settings.state_file);
    let report = Orchestrator::new(settings, &sink)
        .run(&mut ledger, now)
        .expect("run");
    drop(sink);
    (report, rx.into_iter().collect())
}

#[test]
fn once_path_commits_then_is_not_due_after_reload() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let target = Arc::new(RecordingTarget::default());
    let spec = fx.spec(fx.source("docs"), Schedule::Once, target.clone());
    let identity = spec.identity.clone();
    let settings = fx.settings(vec![spec]);

    let (report, events) = run_at(&settings, 19);
    let PathOutcome::Committed { bytes } = report.paths[0].outcome else {
        panic!("expected commit, got {:?}", report.paths[0].outcome);
    };
    assert!(bytes > 0);
    assert_eq!(report.uploaded.get("command:recording"), Some(&bytes));
    assert_eq!(report.stored.get("command:recording"), Some(&bytes));
    assert_eq!(
        target.calls(),
        [
            format!("remove backups/{identity}.bin"),
            format!("upload {identity}.bin -> backups/"),
        ]
    );
    assert!(!fx.work.join(format!("{identity}.bin")).exists());
    assert!(matches!(events.last(), Some(BackupEvent::Summary(_))));

    let ledger = Ledger::load(&fx.state);
    let entry = ledger.get(&identity).expect("ledger entry");
    assert_eq!(entry.archive_size, bytes);
    assert!(entry.last_backup.is_some());

    let (report, _) = run_at(&settings, 20);
    assert_eq!(
        report.paths[0].outcome,
        PathOutcome::NotDue {
            reason: "already_backed_up_once"
        }
    );
    assert_eq!(target.calls().len(), 2);
}

#[test]
fn daily_path_with_unchanged_content_skips_upload() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let target = Arc::new(RecordingTarget::default());
    let settings = fx.settings(vec![fx.spec(fx.source("docs"), Schedule::Daily, target.clone())]);

    let (first, _) = run_at(&settings, 19);
    assert!(matches!(first.paths[0].outcome, PathOutcome::Committed { .. }));
    let before = fs::read_to_string(&fx.state).expect("state");

    let (same_day, _) = run_at(&settings, 19);
    assert!(matches!(same_day.paths[0].outcome, PathOutcome::NotDue { .. }));

    let (next_day, _) = run_at(&settings, 20);
    assert_eq!(next_day.paths[0].outcome, PathOutcome::Unchanged);
    assert!(next_day.uploaded.is_empty());
    assert_eq!(target.calls().len(), 2);
    assert_eq!(fs::read_to_string(&fx.state).expect("state"), before);
}

#[test]
fn upload_failure_keeps_local_archive_and_ledger() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let failing = Arc::new(RecordingTarget {
        fail_uploads: true,
        ..Default::default()
    });
    let spec = fx.spec(fx.source("docs"), Schedule::Daily, failing);
    let archive = fx.work.join(spec.archive_name());
    let settings = fx.settings(vec![spec]);

    let (report, events) = run_at(&settings, 19);
    let PathOutcome::Failed { phase, error } = &report.paths[0].outcome else {
        panic!("expected failure, got {:?}", report.paths[0].outcome);
    };
    assert_eq!(*phase, Phase::Upload);
    assert!(error.contains("refused"), "{error}");
    assert_eq!(report.failed(), 1);
    assert!(archive.exists());
    assert!(!fx.state.exists());
    assert!(events.iter().any(|e| matches!(
        e,
        BackupEvent::PathFailed {
            phase: Phase::Upload,
            ..
        }
    )));
}

#[test]
fn archive_failure_is_isolated_to_its_path() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let target = Arc::new(RecordingTarget::default());
    let doomed = fx.spec(fx.source("doomed"), Schedule::Daily, target.clone());
    let healthy = fx.spec(fx.source("healthy"), Schedule::Daily, target.clone());
    let doomed_id = doomed.identity.clone();
    let healthy_id = healthy.identity.clone();
    fs::remove_dir_all(fx.root.join("doomed")).expect("delete source");
    let settings = fx.settings(vec![doomed, healthy]);

    let (report, _) = run_at(&settings, 19);
    assert!(matches!(
        report.paths[0].outcome,
        PathOutcome::Failed {
            phase: Phase::Archive,
            ..
        }
    ));
    assert!(matches!(report.paths[1].outcome, PathOutcome::Committed { .. }));

    let ledger = Ledger::load(&fx.state);
    assert!(ledger.get(&doomed_id).is_none());
    assert!(ledger.get(&healthy_id).is_some());
}

#[test]
fn ledger_write_failure_stops_the_run() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let target = Arc::new(RecordingTarget::default());
    let first = fx.spec(fx.source("first"), Schedule::Daily, target.clone());
    let second = fx.spec(fx.source("second"), Schedule::Daily, target.clone());
    let mut settings = fx.settings(vec![first, second]);
    // A regular file where the ledger's directory should be.
    fs::write(fx.root.join("blocked"), b"").expect("write blocker");
    settings.state_file = fx.root.join("blocked/state.csv");

    let (tx, _rx) = mpsc::channel();
    let sink = ChannelSink::new(tx);
    let mut ledger = Ledger::load(&settings.state_file);
    let err = Orchestrator::new(&settings, &sink)
        .run(&mut ledger, Local::now())
        .expect_err("ledger write fails");
    assert_eq!(err.kind(), ErrorKind::Ledger);
    assert!(err.is_fatal());
    assert_eq!(target.calls().len(), 2, "second path must not be attempted");
}

#[test]
fn dir_target_receives_archive_under_remote_dir() {
    if !have_bin("tar") {
        return;
    }
    let fx = Fixture::new();
    let store = fx.root.join("usb");
    fs::create_dir_all(&store).expect("mkdir store");
    let target = DirTarget::from_config(
        "usb",
        &DirTargetConfig {
            path: store.display().to_string(),
            ..Default::default()
        },
    )
    .expect("dir target");
    let spec = fx.spec(fx.source("docs"), Schedule::Weekly, Arc::new(target));
    let name = spec.archive_name();
    let settings = fx.settings(vec![spec]);

    let (report, _) = run_at(&settings, 19);
    assert!(matches!(report.paths[0].outcome, PathOutcome::Committed { .. }));
    assert!(store.join("backups").join(&name).is_file());
    assert!(report.uploaded.contains_key("dir:usb"));

    // No allowed weekdays: weekly paths never recur after the first run.
    let (later, _) = run_at(&settings, 26);
    assert!(matches!(later.paths[0].outcome, PathOutcome::NotDue { .. }));
}
