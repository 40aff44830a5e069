use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{RemoteTarget, local_file_name, remote_object_path, resolve_required_string_field};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DirTargetConfig {
    pub path: String,
    pub path_env: Option<String>,
}

/// A mounted directory (USB disk, NFS share) used as object storage.
#[derive(Debug, Clone)]
pub struct DirTarget {
    name: String,
    root: PathBuf,
}

impl DirTarget {
    pub fn from_config(name: &str, cfg: &DirTargetConfig) -> Result<Self> {
        let root = resolve_required_string_field(
            &format!("targets.dir.{name}.path"),
            Some(cfg.path.as_str()),
            cfg.path_env.as_deref(),
        )?;
        Ok(Self {
            name: name.to_string(),
            root: PathBuf::from(root),
        })
    }

    // The root is checked per call; removable media may come and go between runs.
    fn object_path(&self, remote_path: &str) -> Result<PathBuf> {
        if !self.root.is_dir() {
            return Err(Error::transfer(format!(
                "target directory {} is not available",
                self.root.display()
            )));
        }
        let rel = remote_path.trim_start_matches('/');
        if rel.split('/').any(|c| c == "..") {
            return Err(Error::transfer(format!(
                "remote path '{remote_path}' escapes the target directory"
            )));
        }
        Ok(self.root.join(rel))
    }
}

impl RemoteTarget for DirTarget {
    fn identify(&self) -> String {
        format!("dir:{}", self.name)
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let p = self.object_path(remote_path)?;
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::transfer(format!(
                "failed to remove {}: {e}",
                p.display()
            ))),
        }
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let name = local_file_name(local)?;
        let dst = self.object_path(&remote_object_path(remote_prefix, &name))?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::transfer(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let tmp = dst.with_file_name(format!(".{name}.partial"));
        let copied = fs::copy(local, &tmp).and_then(|_| fs::rename(&tmp, &dst));
        if let Err(e) = copied {
            let _ = fs::remove_file(&tmp);
            return Err(Error::transfer(format!(
                "failed to copy {} to {}: {e}",
                local.display(),
                dst.display()
            )));
        }
        Ok(())
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let src = self.object_path(remote_path)?;
        fs::copy(&src, local).map_err(|e| {
            Error::transfer(format!(
                "failed to copy {} to {}: {e}",
                src.display(),
                local.display()
            ))
        })?;
        Ok(())
    }
}
