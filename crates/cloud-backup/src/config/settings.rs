use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{self, Component, Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use super::{ConfigDoc, expand_home};
use crate::archive::{ChangeDetection, DEFAULT_COMPRESSION_LEVEL, PipelineOptions};
use crate::error::{Error, Result};
use crate::hash::path_identity;
use crate::remote::{SharedTarget, TargetRegistry, TargetsConfig, resolve_string_field};
use crate::schedule::{AllowedDays, Schedule, parse_weekday, validate_month_day};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSection {
    pub working_dir: String,
    pub state_file: String,
    pub passphrase: Option<String>,
    pub passphrase_env: Option<String>,
    pub compression_level: Option<u32>,
    pub weekly: Vec<String>,
    pub monthly: Vec<u32>,
    pub target: Option<String>,
    pub remote_dir: String,
    pub change_detection: ChangeDetection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PathEntry {
    pub path: String,
    pub schedule: Schedule,
    pub exclude: Vec<String>,
    pub compression: Option<bool>,
    pub encryption: Option<bool>,
    pub target: Option<String>,
}

/// One configured backup unit, fully resolved.
#[derive(Clone)]
pub struct PathSpec {
    /// Canonical absolute source path.
    pub path: PathBuf,
    pub identity: String,
    pub schedule: Schedule,
    pub exclude: Vec<String>,
    pub compression: bool,
    pub encryption: bool,
    pub target: SharedTarget,
}

impl PathSpec {
    /// A once-scheduled, compressed, unencrypted spec for `path`.
    pub fn new(path: PathBuf, target: SharedTarget) -> Self {
        Self {
            identity: path_identity(&path),
            path,
            schedule: Schedule::Once,
            exclude: Vec::new(),
            compression: true,
            encryption: false,
            target,
        }
    }

    pub fn archive_name(&self) -> String {
        format!("{}.bin", self.identity)
    }
}

impl fmt::Debug for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathSpec")
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("schedule", &self.schedule)
            .field("exclude", &self.exclude)
            .field("compression", &self.compression)
            .field("encryption", &self.encryption)
            .field("target", &self.target.identify())
            .finish()
    }
}

/// How much of the filesystem a settings load may touch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadMode {
    /// Creates the working directory; every source path must exist.
    #[default]
    Backup,
    /// Creates nothing. A missing source keeps its normalised configured
    /// path, so its archive can still be found and restored.
    ReadOnly,
}

/// Validated run settings. Everything the engine needs, nothing it has to
/// re-check.
#[derive(Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub work_dir: PathBuf,
    pub state_file: PathBuf,
    pub passphrase: Option<String>,
    pub compression_level: u32,
    pub days: AllowedDays,
    pub remote_dir: String,
    pub change_detection: ChangeDetection,
    pub paths: Vec<PathSpec>,
    pub targets: TargetRegistry,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("config_path", &self.config_path)
            .field("work_dir", &self.work_dir)
            .field("state_file", &self.state_file)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("compression_level", &self.compression_level)
            .field("days", &self.days)
            .field("remote_dir", &self.remote_dir)
            .field("change_detection", &self.change_detection)
            .field("paths", &self.paths)
            .field("targets", &self.targets)
            .finish()
    }
}

impl Settings {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Self::from_doc_with(doc, LoadMode::Backup)
    }

    pub fn from_doc_with(doc: &ConfigDoc, mode: LoadMode) -> Result<Self> {
        let backup: BackupSection = doc.deserialize_path("backup")?.ok_or_else(|| {
            Error::config(format!("[backup] section missing in {}", doc.path.display()))
        })?;
        let targets_cfg: TargetsConfig = doc.deserialize_path("targets")?.unwrap_or_default();
        let entries: Vec<PathEntry> = doc.deserialize_path("paths")?.unwrap_or_default();
        let base = doc.base_dir();

        let work_dir = required_path(base, "backup.working_dir", &backup.working_dir)?;
        let work_dir = match mode {
            LoadMode::Backup => {
                fs::create_dir_all(&work_dir).map_err(|e| {
                    Error::config(format!(
                        "failed to create working_dir {}: {e}",
                        work_dir.display()
                    ))
                })?;
                work_dir.canonicalize().map_err(|e| {
                    Error::config(format!("working_dir {}: {e}", work_dir.display()))
                })?
            }
            LoadMode::ReadOnly => normalize_path(&work_dir),
        };
        let state_file = required_path(base, "backup.state_file", &backup.state_file)?;

        let passphrase = resolve_string_field(
            backup.passphrase.as_deref(),
            backup.passphrase_env.as_deref(),
        );
        if let Some(env) = backup.passphrase_env.as_deref()
            && passphrase.is_none()
        {
            warn!(env, "passphrase_env is set but the variable is empty or unset");
        }

        let compression_level = backup.compression_level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        if compression_level > 9 {
            return Err(Error::config(format!(
                "backup.compression_level must be 0-9, got {compression_level}"
            )));
        }

        let days = AllowedDays {
            weekly: backup
                .weekly
                .iter()
                .map(|d| parse_weekday(d))
                .collect::<Result<Vec<_>>>()?,
            monthly: backup
                .monthly
                .iter()
                .map(|d| validate_month_day(*d))
                .collect::<Result<Vec<_>>>()?,
        };

        let targets = TargetRegistry::from_config(&targets_cfg)?;
        let default_target = backup
            .target
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let mut seen = BTreeSet::new();
        let mut paths = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let spec = resolve_path_entry(
                idx,
                entry,
                base,
                &targets,
                default_target,
                passphrase.is_some(),
                mode,
            )?;
            if !seen.insert(spec.path.clone()) {
                return Err(Error::config(format!(
                    "path {} is configured more than once",
                    spec.path.display()
                )));
            }
            warn_unreachable_schedule(&spec, &days);
            paths.push(spec);
        }

        Ok(Self {
            config_path: doc.path.clone(),
            work_dir,
            state_file,
            passphrase,
            compression_level,
            days,
            remote_dir: normalize_remote_dir(&backup.remote_dir),
            change_detection: backup.change_detection,
            paths,
            targets,
        })
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            work_dir: self.work_dir.clone(),
            compression_level: self.compression_level,
            passphrase: self.passphrase.clone(),
            change_detection: self.change_detection,
        }
    }

    /// Looks up a configured path by the user's spelling of it.
    pub fn find_path(&self, raw: &str) -> Result<&PathSpec> {
        let wanted = expand_home(raw.trim());
        let wanted = normalize_path(&path::absolute(&wanted).unwrap_or(wanted));
        self.paths
            .iter()
            .find(|p| p.path == wanted)
            .ok_or_else(|| {
                Error::config(format!("{} is not a configured path", wanted.display()))
            })
    }

    /// Remote object path of a spec's archive.
    pub fn remote_path(&self, spec: &PathSpec) -> String {
        format!("{}{}", self.remote_dir, spec.archive_name())
    }
}

fn required_path(base: &Path, key: &str, raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::config(format!("{key} is not set")));
    }
    Ok(absolutize(base, raw))
}

fn absolutize(base: &Path, raw: &str) -> PathBuf {
    let p = expand_home(raw);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Canonical form of `p`. For a path that does not exist, the deepest
/// existing ancestor is canonicalised and the rest is appended with `.` and
/// `..` folded, which matches what `canonicalize` gave while it existed
/// unless the missing part held symlinks.
fn normalize_path(p: &Path) -> PathBuf {
    if let Ok(c) = p.canonicalize() {
        return c;
    }
    let mut folded = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other.as_os_str()),
        }
    }
    let mut tail = Vec::new();
    let mut cur = folded.as_path();
    while let (Some(parent), Some(name)) = (cur.parent(), cur.file_name()) {
        tail.push(name.to_owned());
        if let Ok(mut out) = parent.canonicalize() {
            out.extend(tail.iter().rev());
            return out;
        }
        cur = parent;
    }
    folded
}

fn normalize_remote_dir(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() || raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

fn resolve_path_entry(
    idx: usize,
    entry: &PathEntry,
    base: &Path,
    targets: &TargetRegistry,
    default_target: Option<&str>,
    has_passphrase: bool,
    mode: LoadMode,
) -> Result<PathSpec> {
    let raw = entry.path.trim();
    if raw.is_empty() {
        return Err(Error::config(format!("paths[{idx}].path is empty")));
    }
    let abs = absolutize(base, raw);
    let path = match abs.canonicalize() {
        Ok(p) => p,
        Err(e) if mode == LoadMode::ReadOnly && e.kind() == io::ErrorKind::NotFound => {
            let p = normalize_path(&abs);
            warn!(path = %p.display(), "source path is missing");
            p
        }
        Err(e) => {
            return Err(Error::config(format!(
                "paths[{idx}]: source path {raw} is not accessible: {e}"
            )));
        }
    };

    let target_ref = entry
        .target
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(default_target)
        .ok_or_else(|| {
            Error::config(format!(
                "no target for path {} (set paths[{idx}].target or backup.target)",
                path.display()
            ))
        })?;
    let target = targets.resolve(target_ref)?;

    let encryption = entry.encryption.unwrap_or(has_passphrase);
    if encryption && !has_passphrase {
        return Err(Error::config(format!(
            "path {} requests encryption but no passphrase is configured",
            path.display()
        )));
    }

    let mut spec = PathSpec::new(path, target);
    spec.schedule = entry.schedule;
    spec.exclude = entry
        .exclude
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    spec.compression = entry.compression.unwrap_or(true);
    spec.encryption = encryption;
    Ok(spec)
}

fn warn_unreachable_schedule(spec: &PathSpec, days: &AllowedDays) {
    let empty = match spec.schedule {
        Schedule::Weekly => days.weekly.is_empty(),
        Schedule::Monthly => days.monthly.is_empty(),
        Schedule::Once | Schedule::Daily => false,
    };
    if empty {
        warn!(
            path = %spec.path.display(),
            schedule = %spec.schedule,
            "no allowed days configured; path will only be backed up once"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().expect("tempdir");
            let root = tmp.path().canonicalize().expect("canonical");
            fs::create_dir_all(root.join("docs")).expect("mkdir docs");
            fs::create_dir_all(root.join("photos")).expect("mkdir photos");
            fs::create_dir_all(root.join("usb")).expect("mkdir usb");
            Self { _tmp: tmp, root }
        }

        fn doc(&self, body: &str) -> ConfigDoc {
            let header = format!(
                r#"
[targets.dir.usb]
path = "{root}/usb"

[targets.command.nas]
upload = "cp {{local}} /srv/{{name}}"
remove = "rm -f /srv/{{name}}"
download = "cp /srv/{{name}} {{local}}"
"#,
                root = self.root.display()
            );
            ConfigDoc::parse(self.root.join("cloud-backup.toml"), &format!("{header}\n{body}"))
                .expect("parse")
        }
    }

    #[test]
    fn resolves_paths_targets_and_defaults() {
        let fx = Fixture::new();
        let doc = fx.doc(
            r#"
[backup]
working_dir = "work"
state_file = "state.csv"
passphrase = "secret"
weekly = ["mon", "thu"]
monthly = [1, 15]
target = "usb"
remote_dir = "backups"

[[paths]]
path = "docs"
schedule = "daily"
exclude = ["*.tmp"]

[[paths]]
path = "photos"
schedule = "weekly"
encryption = false
compression = false
target = "command:nas"
"#,
        );
        let s = Settings::from_doc(&doc).expect("settings");
        assert_eq!(s.work_dir, fx.root.join("work"));
        assert!(s.work_dir.is_dir());
        assert_eq!(s.state_file, fx.root.join("state.csv"));
        assert_eq!(s.compression_level, DEFAULT_COMPRESSION_LEVEL);
        assert_eq!(s.days.weekly, [Weekday::Mon, Weekday::Thu]);
        assert_eq!(s.days.monthly, [1, 15]);
        assert_eq!(s.remote_dir, "backups/");
        assert_eq!(s.change_detection, ChangeDetection::Archive);

        let docs = &s.paths[0];
        assert_eq!(docs.path, fx.root.join("docs"));
        assert_eq!(docs.identity, path_identity(&fx.root.join("docs")));
        assert_eq!(docs.schedule, Schedule::Daily);
        assert!(docs.compression && docs.encryption);
        assert_eq!(docs.target.identify(), "dir:usb");
        assert_eq!(
            s.remote_path(docs),
            format!("backups/{}.bin", docs.identity)
        );

        let photos = &s.paths[1];
        assert!(!photos.compression && !photos.encryption);
        assert_eq!(photos.target.identify(), "command:nas");

        assert_eq!(
            s.find_path(&fx.root.join("docs").display().to_string())
                .expect("find")
                .identity,
            docs.identity
        );
        assert!(s.find_path("/nowhere").is_err());
    }

    fn expect_config_err(fx: &Fixture, body: &str, needle: &str) {
        let err = Settings::from_doc(&fx.doc(body)).expect_err(needle);
        assert_eq!(err.kind(), crate::error::ErrorKind::Config, "{err}");
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn rejects_invalid_configs() {
        let fx = Fixture::new();
        expect_config_err(&fx, "[backup]\nstate_file = \"s\"\n", "working_dir");
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\ncompression_level = 12\n",
            "compression_level",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\nweekly = [\"t\"]\n",
            "ambiguous",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\nmonthly = [32]\n",
            "out of range",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\n[[paths]]\npath = \"missing\"\ntarget = \"usb\"\n",
            "not accessible",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\n[[paths]]\npath = \"docs\"\n",
            "no target",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\n[[paths]]\npath = \"docs\"\ntarget = \"gdrive\"\n",
            "unknown target",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\n[[paths]]\npath = \"docs\"\ntarget = \"usb\"\nencryption = true\n",
            "passphrase",
        );
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\ntarget = \"usb\"\n[[paths]]\npath = \"docs\"\n[[paths]]\npath = \"./docs/\"\n",
            "more than once",
        );
    }

    #[test]
    fn read_only_load_keeps_missing_sources_and_creates_nothing() {
        let fx = Fixture::new();
        let body = r#"
[backup]
working_dir = "work"
state_file = "state.csv"
target = "usb"

[[paths]]
path = "docs"

[[paths]]
path = "./gone/../vanished"
"#;
        let doc = fx.doc(body);
        let err = Settings::from_doc(&doc).expect_err("missing source");
        assert!(err.to_string().contains("not accessible"), "{err}");
        let _ = fs::remove_dir_all(fx.root.join("work"));

        let s = Settings::from_doc_with(&doc, LoadMode::ReadOnly).expect("read-only");
        assert!(!fx.root.join("work").exists());
        assert_eq!(s.work_dir, fx.root.join("work"));

        let gone = &s.paths[1];
        assert_eq!(gone.path, fx.root.join("vanished"));
        assert_eq!(gone.identity, path_identity(&fx.root.join("vanished")));
        assert_eq!(
            s.find_path(&fx.root.join("vanished").display().to_string())
                .expect("find missing")
                .identity,
            gone.identity
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let fx = Fixture::new();
        expect_config_err(
            &fx,
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\ncompresion_level = 3\n",
            "compresion_level",
        );
    }

    #[test]
    fn passphrase_resolves_from_env() {
        let fx = Fixture::new();
        unsafe {
            std::env::set_var("CLOUD_BACKUP_TEST_PASSPHRASE", "from-env");
        }
        let s = Settings::from_doc(&fx.doc(
            "[backup]\nworking_dir = \"w\"\nstate_file = \"s\"\npassphrase_env = \"CLOUD_BACKUP_TEST_PASSPHRASE\"\nchange_detection = \"source\"\n",
        ))
        .expect("settings");
        assert_eq!(s.passphrase.as_deref(), Some("from-env"));
        assert_eq!(s.change_detection, ChangeDetection::Source);
        assert!(s.paths.is_empty());
    }
}
