//! Durable per-path backup state.
//!
//! On-disk format, one line per path, comma separated and newline terminated:
//!
//! ```text
//! <path>,<identity fingerprint>,<content fingerprint>,<timestamp>,<archive size>
//! ```
//!
//! The path is informational; entries are keyed by identity fingerprint. The
//! path field may itself contain commas, so lines are split from the right.
//! Backslash, CR and LF in the path are written as `\\`, `\r` and `\n` so
//! that every record stays on one line.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, SecondsFormat};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LedgerEntry {
    pub path: String,
    pub content_fingerprint: String,
    pub last_backup: Option<DateTime<Local>>,
    pub archive_size: u64,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Loads the ledger. A missing or malformed file yields an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(ledger = %path.display(), "no ledger yet; starting fresh");
                return Self::empty(path);
            }
            Err(e) => {
                warn!(ledger = %path.display(), error = %e, "ledger unreadable; starting fresh");
                return Self::empty(path);
            }
        };
        match parse_entries(&raw) {
            Ok(entries) => Self { path, entries },
            Err(e) => {
                warn!(ledger = %path.display(), error = %e, "ledger malformed; starting fresh");
                Self::empty(path)
            }
        }
    }

    pub fn get(&self, identity: &str) -> Option<&LedgerEntry> {
        self.entries.get(identity)
    }

    pub fn entries(&self) -> &BTreeMap<String, LedgerEntry> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, identity: impl Into<String>, entry: LedgerEntry) {
        self.entries.insert(identity.into(), entry);
    }

    /// Rewrites the whole file. Failures are `ErrorKind::Ledger`.
    pub fn save(&self) -> Result<()> {
        let body = render_entries(&self.entries);
        atomic_write_text(&self.path, &body).map_err(|e| {
            Error::ledger(format!(
                "failed to write ledger {}: {e}",
                self.path.display()
            ))
        })
    }
}

pub fn parse_entries(raw: &str) -> Result<BTreeMap<String, LedgerEntry>> {
    let mut out = BTreeMap::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (identity, entry) = parse_line(line)
            .map_err(|e| Error::msg(format!("line {}: {e}", idx + 1)))?;
        out.insert(identity, entry);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<(String, LedgerEntry)> {
    let mut fields = line.rsplitn(5, ',');
    let size = fields.next().unwrap_or_default();
    let (Some(stamp), Some(content), Some(identity), Some(path)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(Error::msg("expected 5 comma separated fields"));
    };
    let identity = identity.trim();
    if identity.is_empty() {
        return Err(Error::msg("empty identity fingerprint"));
    }
    let archive_size = size
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::msg(format!("bad archive size '{size}': {e}")))?;
    Ok((
        identity.to_string(),
        LedgerEntry {
            path: unescape_path(path),
            content_fingerprint: content.trim().to_string(),
            last_backup: parse_timestamp(stamp)?,
            archive_size,
        },
    ))
}

// Year 1 is the zero time written by older ledgers for "never".
fn parse_timestamp(raw: &str) -> Result<Option<DateTime<Local>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let ts = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| Error::msg(format!("bad timestamp '{raw}': {e}")))?;
    if ts.year() <= 1 {
        return Ok(None);
    }
    Ok(Some(ts.with_timezone(&Local)))
}

pub fn render_entries(entries: &BTreeMap<String, LedgerEntry>) -> String {
    let mut out = String::new();
    for (identity, e) in entries {
        let stamp = e
            .last_backup
            .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            .unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{},{}\n",
            escape_path(&e.path),
            identity,
            e.content_fingerprint,
            stamp,
            e.archive_size
        ));
    }
    out
}

fn escape_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

pub(crate) fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::msg(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

/// Deletes the ledger file; a missing file is not an error.
pub fn reset(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::ledger(format!(
            "failed to remove ledger {}: {e}",
            path.display()
        ))),
    }
}
