//! Remote storage targets.
//!
//! A target adapts the uniform `remove`/`upload`/`download` call shape to one
//! storage backend. Targets hold no per-call state; every call receives the
//! full local path and remote path it needs. Targets are built once, when the
//! configuration is loaded, and shared between paths through `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::log_sanitize::{command_line, summarize_output};

pub mod command;
pub mod dir;
pub mod http;
pub mod s3;
pub mod ssh;

pub use command::{CommandTarget, CommandTargetConfig};
pub use dir::{DirTarget, DirTargetConfig};
pub use http::{HttpTarget, HttpTargetConfig};
pub use s3::{S3Target, S3TargetConfig};
pub use ssh::{SshTarget, SshTargetConfig};

pub trait RemoteTarget: Send + Sync + fmt::Debug {
    /// Stable symbolic name, `kind:name`.
    fn identify(&self) -> String;

    /// Executables that must be on `PATH` for this target to work.
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }

    /// Deletes the object at `remote_path`. Removing a missing object succeeds
    /// where the backend can tell the difference.
    fn remove(&self, remote_path: &str) -> Result<()>;

    /// Stores `local` as `<remote_prefix><file name of local>`.
    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()>;

    /// Fetches the object at `remote_path` into `local`.
    fn download(&self, remote_path: &str, local: &Path) -> Result<()>;
}

pub type SharedTarget = Arc<dyn RemoteTarget>;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TargetsConfig {
    pub s3: BTreeMap<String, S3TargetConfig>,
    pub ssh: BTreeMap<String, SshTargetConfig>,
    pub http: BTreeMap<String, HttpTargetConfig>,
    pub dir: BTreeMap<String, DirTargetConfig>,
    pub command: BTreeMap<String, CommandTargetConfig>,
}

const KINDS: &[&str] = &["s3", "ssh", "http", "dir", "command"];

#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    // Keyed by "kind:name".
    targets: BTreeMap<String, SharedTarget>,
}

impl TargetRegistry {
    pub fn from_config(cfg: &TargetsConfig) -> Result<Self> {
        let mut reg = Self::default();
        for (name, c) in &cfg.s3 {
            reg.insert("s3", name, Arc::new(S3Target::from_config(name, c)?))?;
        }
        for (name, c) in &cfg.ssh {
            reg.insert("ssh", name, Arc::new(SshTarget::from_config(name, c)?))?;
        }
        for (name, c) in &cfg.http {
            reg.insert("http", name, Arc::new(HttpTarget::from_config(name, c)?))?;
        }
        for (name, c) in &cfg.dir {
            reg.insert("dir", name, Arc::new(DirTarget::from_config(name, c)?))?;
        }
        for (name, c) in &cfg.command {
            reg.insert(
                "command",
                name,
                Arc::new(CommandTarget::from_config(name, c)?),
            )?;
        }
        Ok(reg)
    }

    pub fn insert(&mut self, kind: &str, name: &str, target: SharedTarget) -> Result<()> {
        let name = name.trim();
        if name.is_empty() || name.contains(':') {
            return Err(Error::config(format!(
                "invalid target name '{name}' for kind '{kind}'"
            )));
        }
        let key = format!("{kind}:{name}");
        if self.targets.insert(key.clone(), target).is_some() {
            return Err(Error::config(format!("duplicate target '{key}'")));
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// Resolves `kind:name`, or a bare `name` that is unique across kinds.
    pub fn resolve(&self, reference: &str) -> Result<SharedTarget> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::config("empty target reference"));
        }

        if let Some((kind, name)) = reference.split_once(':') {
            let kind = kind.trim();
            if !KINDS.contains(&kind) {
                return Err(Error::config(format!(
                    "unknown target kind '{kind}'; expected one of {}",
                    KINDS.join("/")
                )));
            }
            let key = format!("{kind}:{}", name.trim());
            return self
                .targets
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::config(format!("unknown target '{key}'")));
        }

        let mut hits = self
            .targets
            .iter()
            .filter(|(key, _)| key.split_once(':').map(|(_, n)| n) == Some(reference))
            .collect::<Vec<_>>();
        match hits.len() {
            0 => Err(Error::config(format!(
                "unknown target '{reference}' (known: {})",
                self.names().collect::<Vec<_>>().join(", ")
            ))),
            1 => Ok(hits.remove(0).1.clone()),
            _ => Err(Error::config(format!(
                "ambiguous target '{reference}'; use kind:name"
            ))),
        }
    }
}

/// Joins a remote prefix (empty or ending in `/`) and an object name.
pub fn remote_object_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}/{name}")
    }
}

pub(crate) fn local_file_name(local: &Path) -> Result<String> {
    local
        .file_name()
        .and_then(|s| s.to_str())
        .map(ToOwned::to_owned)
        .ok_or_else(|| Error::transfer(format!("invalid local file {}", local.display())))
}

pub(crate) fn run_command_capture(mut cmd: Command) -> Result<()> {
    let out = run_command_output(&mut cmd)?;
    if out.status.success() {
        return Ok(());
    }
    Err(Error::transfer(format!(
        "command failed: {}",
        command_summary(&out)
    )))
}

pub(crate) fn run_command_output(cmd: &mut Command) -> Result<Output> {
    debug!(command = %command_line(cmd), "running remote command");
    cmd.output().map_err(|e| {
        Error::transfer(format!("failed to run {}: {e}", command_line(cmd)))
    })
}

pub(crate) fn command_summary(out: &Output) -> String {
    let stderr = summarize_output(&out.stderr);
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = summarize_output(&out.stdout);
    if !stdout.is_empty() {
        return stdout;
    }
    format!("status {}", out.status)
}

pub(crate) fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| resolve_env_ref(env_key))
}

pub(crate) fn resolve_required_string_field(
    cfg_path: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| {
        if let Some(k) = env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Error::config(format!("{cfg_path} is empty (also checked env var '{k}')"))
        } else {
            Error::config(format!("{cfg_path} is empty"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TargetRegistry {
        let cfg: TargetsConfig = toml::from_str(
            r#"
[dir.usb]
path = "/mnt/usb"

[dir.nas]
path = "/mnt/nas"

[command.nas]
upload = "cp {local} /tmp/{name}"
remove = "rm -f /tmp/{name}"
download = "cp /tmp/{name} {local}"
"#,
        )
        .expect("parse targets");
        TargetRegistry::from_config(&cfg).expect("registry")
    }

    #[test]
    fn resolves_qualified_and_unique_names() {
        let reg = registry();
        assert_eq!(reg.resolve("dir:nas").expect("qualified").identify(), "dir:nas");
        assert_eq!(reg.resolve("usb").expect("bare").identify(), "dir:usb");
    }

    #[test]
    fn rejects_ambiguous_and_unknown_refs() {
        let reg = registry();
        let err = reg.resolve("nas").expect_err("ambiguous");
        assert!(err.to_string().contains("ambiguous"), "{err}");
        assert!(reg.resolve("gdrive").is_err());
        assert!(reg.resolve("ftp:usb").is_err());
        assert!(reg.resolve("dir:missing").is_err());
    }

    #[test]
    fn spawn_failure_does_not_expose_command_env() {
        let mut cmd = Command::new("cloud-backup-no-such-uploader");
        cmd.env("UPLOAD_TOKEN", "tok-7731-secret").arg("put");
        let err = run_command_output(&mut cmd).expect_err("missing program");
        let msg = err.to_string();
        assert!(msg.contains("cloud-backup-no-such-uploader put"), "{msg}");
        assert!(!msg.contains("tok-7731-secret"), "{msg}");
    }

    #[test]
    fn object_paths_join_prefix() {
        assert_eq!(remote_object_path("", "a.bin"), "a.bin");
        assert_eq!(remote_object_path("backups/", "a.bin"), "backups/a.bin");
        assert_eq!(remote_object_path("backups", "a.bin"), "backups/a.bin");
    }

    #[test]
    fn literal_wins_over_env() {
        unsafe {
            std::env::set_var("CLOUD_BACKUP_TEST_FIELD", "from-env");
        }
        assert_eq!(
            resolve_string_field(Some("literal"), Some("CLOUD_BACKUP_TEST_FIELD")).as_deref(),
            Some("literal")
        );
        assert_eq!(
            resolve_string_field(Some("  "), Some("CLOUD_BACKUP_TEST_FIELD")).as_deref(),
            Some("from-env")
        );
        assert!(resolve_required_string_field("x.y", None, Some("CLOUD_BACKUP_TEST_UNSET")).is_err());
    }
}
