//! Configuration document loading.
//!
//! A config file is TOML. Any table may carry `imports = ["other.toml"]`;
//! imported files are merged first and the importing table is layered on
//! top, so a shared credentials file can be pulled into several configs.
//! Arrays are replaced, not concatenated.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

mod settings;

pub use settings::{BackupSection, LoadMode, PathEntry, PathSpec, Settings};

pub const CONFIG_FILE_NAME: &str = "cloud-backup.toml";

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{path}': {e}")))?;
        Ok(Some(parsed))
    }

    /// Directory relative paths in this document are resolved against.
    pub fn base_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = expand_home(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, table: &toml::value::Table) -> Result<Vec<String>> {
    let Some(raw) = table.get("imports") else {
        return Ok(Vec::new());
    };
    let Some(arr) = raw.as_array() else {
        return Err(Error::config(format!(
            "imports in {} must be an array of strings",
            path.display()
        )));
    };
    let mut out = Vec::new();
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(Error::config(format!(
                "invalid imports entry in {} (expected string)",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn inline_imports(file_path: &Path, value: &mut Value, stack: &mut HashSet<PathBuf>) -> Result<()> {
    let Value::Table(tbl) = value else {
        return Ok(());
    };

    let imports = parse_imports(file_path, tbl)?;
    tbl.remove("imports");
    if !imports.is_empty() {
        let mut acc = Value::Table(Default::default());
        for imp in imports {
            let loaded = load_value(&resolve_ref_path(file_path, &imp), stack)?;
            merge_values(&mut acc, loaded);
        }
        merge_values(&mut acc, Value::Table(std::mem::take(tbl)));
        if let Value::Table(merged) = acc {
            *tbl = merged;
        }
    }

    for (_, v) in tbl.iter_mut() {
        inline_imports(file_path, v, stack)?;
    }
    Ok(())
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
    inline_imports(path, &mut value, stack)?;

    stack.remove(&canonical);
    Ok(value)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Expands a leading `~` or `~/` to `$HOME`.
pub fn expand_home(raw: &str) -> PathBuf {
    let home = || env::var_os("HOME").map(PathBuf::from);
    if raw == "~" {
        if let Some(h) = home() {
            return h;
        }
    } else if let Some(rest) = raw.strip_prefix("~/")
        && let Some(h) = home()
    {
        return h.join(rest);
    }
    PathBuf::from(raw)
}

/// Config file lookup order: next to the executable, then
/// `$HOME/.config`, then `$HOME`.
pub fn default_config_path() -> Result<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        candidates.push(dir.join(CONFIG_FILE_NAME));
    }
    if let Some(home) = env::var_os("HOME").map(PathBuf::from) {
        candidates.push(home.join(".config").join(CONFIG_FILE_NAME));
        candidates.push(home.join(CONFIG_FILE_NAME));
    }
    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| {
            Error::config(format!(
                "no config file found (looked for {})",
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}
