//! Builds and unpacks per-path archives.
//!
//! Construction is `tar`, then optionally `xz`, then optionally symmetric
//! `gpg`, written to `<work_dir>/<identity>.bin`. Restore runs the mirror
//! chain. Every stage receives absolute paths; the process working directory
//! is never changed.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::PathSpec;
use crate::error::{Error, ErrorKind, Result};
use crate::hash::HashingWriter;
use crate::pipeline::{self, Stage};

pub const DEFAULT_COMPRESSION_LEVEL: u32 = 2;

/// Which byte stream the content fingerprint is taken over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    /// The final, uploaded bytes.
    #[default]
    Archive,
    /// The raw tar stream, before compression and encryption.
    Source,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub work_dir: PathBuf,
    pub compression_level: u32,
    pub passphrase: Option<String>,
    pub change_detection: ChangeDetection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: String,
    /// False when the fingerprint matched the previous one; the file is
    /// already gone in that case.
    pub changed: bool,
}

#[derive(Debug, Clone)]
pub struct ArchivePipeline {
    opts: PipelineOptions,
}

impl ArchivePipeline {
    pub fn new(opts: PipelineOptions) -> Self {
        Self { opts }
    }

    pub fn target_path(&self, spec: &PathSpec) -> PathBuf {
        self.opts.work_dir.join(spec.archive_name())
    }

    /// Archives `spec.path` and compares the result against `previous`.
    /// Errors are always `ErrorKind::Archive`; no partial file is left behind.
    pub fn build(&self, spec: &PathSpec, previous: Option<&str>) -> Result<ArchiveResult> {
        self.build_inner(spec, previous)
            .map_err(|e| e.into_kind(ErrorKind::Archive))
    }

    fn build_inner(&self, spec: &PathSpec, previous: Option<&str>) -> Result<ArchiveResult> {
        let target = self.target_path(spec);
        remove_if_exists(&target)?;
        if fs::symlink_metadata(&spec.path).is_err() {
            return Err(Error::msg(format!(
                "source path {} does not exist",
                spec.path.display()
            )));
        }

        let pass_file = if spec.encryption {
            Some(self.passphrase_file()?)
        } else {
            None
        };
        let mut stages = vec![tar_create(spec)];
        if spec.compression {
            stages.push(xz_compress(self.opts.compression_level));
        }
        if let Some(pf) = pass_file.as_ref() {
            stages.push(gpg(pf.path(), "--symmetric"));
        }
        let tap = self.opts.change_detection == ChangeDetection::Source && stages.len() > 1;

        info!(
            path = %spec.path.display(),
            archive = %target.display(),
            compression = spec.compression,
            encryption = spec.encryption,
            "building archive"
        );
        let file = File::create(&target)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", target.display())))?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        let ran = pipeline::run(stages, None, &mut writer, tap);
        let (buffered, digest, size) = writer.finish();
        let synced = buffered
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|f| f.sync_all());
        drop(pass_file);

        let out = match (ran, synced) {
            (Ok(out), Ok(())) => out,
            (Err(e), _) => {
                let _ = fs::remove_file(&target);
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                let _ = fs::remove_file(&target);
                return Err(Error::msg(format!(
                    "failed to write {}: {e}",
                    target.display()
                )));
            }
        };

        let fingerprint = match self.opts.change_detection {
            ChangeDetection::Source => out.tap_fingerprint.unwrap_or(digest),
            ChangeDetection::Archive => digest,
        };
        let previous = previous.map(str::trim).filter(|p| !p.is_empty());
        let changed = previous != Some(fingerprint.as_str());
        debug!(
            path = %spec.path.display(),
            fingerprint = %fingerprint,
            previous = previous.unwrap_or("-"),
            bytes = size,
            "archive fingerprint"
        );
        if !changed {
            remove_if_exists(&target)?;
        }
        Ok(ArchiveResult {
            path: target,
            size,
            fingerprint,
            changed,
        })
    }

    /// Unpacks `archive` into `dest`, reversing the construction chain with
    /// the path's compression/encryption flags.
    pub fn restore(&self, spec: &PathSpec, archive: &Path, dest: &Path) -> Result<()> {
        self.restore_inner(spec, archive, dest)
            .map_err(|e| e.into_kind(ErrorKind::Archive))
    }

    fn restore_inner(&self, spec: &PathSpec, archive: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
        let input = File::open(archive)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", archive.display())))?;

        let pass_file = if spec.encryption {
            Some(self.passphrase_file()?)
        } else {
            None
        };
        let mut stages = Vec::new();
        if let Some(pf) = pass_file.as_ref() {
            stages.push(gpg(pf.path(), "--decrypt"));
        }
        if spec.compression {
            stages.push(xz_decompress());
        }
        stages.push(tar_extract(dest));

        info!(
            path = %spec.path.display(),
            archive = %archive.display(),
            dest = %dest.display(),
            "restoring archive"
        );
        pipeline::run(stages, Some(input), &mut io::sink(), false)?;
        Ok(())
    }

    fn passphrase_file(&self) -> Result<NamedTempFile> {
        let Some(pass) = self.opts.passphrase.as_deref() else {
            return Err(Error::msg("encryption is enabled but no passphrase is configured"));
        };
        let mut f = tempfile::Builder::new()
            .prefix(".passphrase-")
            .tempfile_in(&self.opts.work_dir)
            .map_err(|e| Error::msg(format!("failed to create passphrase file: {e}")))?;
        f.write_all(pass.as_bytes())
            .and_then(|_| f.flush())
            .map_err(|e| Error::msg(format!("failed to write passphrase file: {e}")))?;
        Ok(f)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}

// Members are stored as `<basename>/...` relative to the parent directory.
fn tar_create(spec: &PathSpec) -> Stage {
    let parent = spec.path.parent().unwrap_or_else(|| Path::new("/"));
    let member = spec
        .path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut cmd = Command::new("tar");
    cmd.arg("--sort=name").arg("--mtime=@0");
    for pattern in &spec.exclude {
        cmd.arg(format!("--exclude={pattern}"));
    }
    cmd.arg("-cf").arg("-").arg("-C").arg(parent).arg(member);
    Stage::new("tar", cmd)
}

fn tar_extract(dest: &Path) -> Stage {
    let mut cmd = Command::new("tar");
    cmd.arg("-xf").arg("-").arg("-C").arg(dest);
    Stage::new("tar", cmd)
}

fn xz_compress(level: u32) -> Stage {
    let mut cmd = Command::new("xz");
    cmd.arg("--compress")
        .arg("--stdout")
        .arg("--threads=1")
        .arg(format!("-{level}"));
    Stage::new("xz", cmd)
}

fn xz_decompress() -> Stage {
    let mut cmd = Command::new("xz");
    cmd.arg("--decompress").arg("--stdout");
    Stage::new("xz", cmd)
}

fn gpg(passphrase_file: &Path, mode: &str) -> Stage {
    let mut cmd = Command::new("gpg");
    cmd.arg("--batch")
        .arg("--yes")
        .arg("--quiet")
        .arg("--no-tty")
        .arg("--pinentry-mode")
        .arg("loopback")
        .arg("--passphrase-file")
        .arg(passphrase_file)
        .arg("-z")
        .arg("0")
        .arg("--output")
        .arg("-")
        .arg(mode);
    Stage::new("gpg", cmd)
}
