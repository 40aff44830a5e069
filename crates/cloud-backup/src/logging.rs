//! Tracing subscriber setup.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{ConfigDoc, expand_home};
use crate::error::{Error, Result};

pub const LOG_ENV: &str = "CLOUD_BACKUP_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// Events are appended here as well as written to stdout.
    pub file: Option<String>,
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        Ok(doc.deserialize_path("logging")?.unwrap_or_default())
    }

    pub fn file_path(&self, base: &Path) -> Option<PathBuf> {
        let raw = self.file.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let p = expand_home(raw);
        Some(if p.is_absolute() { p } else { base.join(p) })
    }

    fn filter(&self, verbose: bool) -> EnvFilter {
        if let Ok(f) = EnvFilter::try_from_env(LOG_ENV) {
            return f;
        }
        let level = if verbose {
            "debug"
        } else {
            self.level.as_deref().unwrap_or("info")
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber: stdout, plus the log file when configured.
pub fn init(cfg: &LoggingConfig, base: &Path, verbose: bool) -> Result<()> {
    let json = cfg.format == LogFormat::Json;
    let stdout = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    let file = match cfg.file_path(base) {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::config(format!("failed to create log dir {}: {e}", parent.display()))
                })?;
            }
            let f = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    Error::config(format!("failed to open log file {}: {e}", path.display()))
                })?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(f))
                .with_ansi(false);
            Some(if json {
                layer.json().boxed()
            } else {
                layer.with_target(false).boxed()
            })
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(cfg.filter(verbose))
        .with(stdout)
        .with(file)
        .try_init()
        .map_err(|e| Error::msg(format!("failed to initialise logging: {e}")))
}
