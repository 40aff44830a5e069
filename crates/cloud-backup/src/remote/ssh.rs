use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use super::{
    RemoteTarget, local_file_name, remote_object_path, resolve_env_ref,
    resolve_required_string_field, resolve_string_field, run_command_capture,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SshTargetConfig {
    // "user@host:/base/path"
    pub target: String,
    pub target_env: Option<String>,
    pub port: Option<u16>,
    pub port_env: Option<String>,
    pub identity_file: Option<String>,
    pub identity_file_env: Option<String>,
    pub known_hosts_file: Option<String>,
    pub known_hosts_file_env: Option<String>,
    pub strict_host_key_checking: Option<bool>,
}

/// Remote directory reached through `ssh`/`scp`.
#[derive(Debug, Clone)]
pub struct SshTarget {
    name: String,
    host: String,
    base_path: String,
    port: Option<u16>,
    identity_file: Option<String>,
    known_hosts_file: Option<String>,
    strict_host_key_checking: Option<bool>,
}

impl SshTarget {
    pub fn from_config(name: &str, cfg: &SshTargetConfig) -> Result<Self> {
        let target = resolve_required_string_field(
            &format!("targets.ssh.{name}.target"),
            Some(cfg.target.as_str()),
            cfg.target_env.as_deref(),
        )?;
        let (host, base_path) = target.split_once(':').ok_or_else(|| {
            Error::config(format!("targets.ssh.{name}.target must be 'host:/path'"))
        })?;

        let port = match cfg.port {
            Some(p) => Some(p),
            None => resolve_env_ref(cfg.port_env.as_deref())
                .map(|s| {
                    s.parse::<u16>().map_err(|e| {
                        Error::config(format!("targets.ssh.{name}.port_env parse failed: {e}"))
                    })
                })
                .transpose()?,
        };

        Ok(Self {
            name: name.to_string(),
            host: host.trim().to_string(),
            base_path: base_path.trim().trim_end_matches('/').to_string(),
            port,
            identity_file: resolve_string_field(
                cfg.identity_file.as_deref(),
                cfg.identity_file_env.as_deref(),
            ),
            known_hosts_file: resolve_string_field(
                cfg.known_hosts_file.as_deref(),
                cfg.known_hosts_file_env.as_deref(),
            ),
            strict_host_key_checking: cfg.strict_host_key_checking,
        })
    }

    fn remote_abs(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base_path, remote_path.trim_start_matches('/'))
    }

    fn command(&self, program: &str) -> Command {
        let scp_style = program == "scp";
        let mut cmd = Command::new(program);
        cmd.arg("-q").arg("-o").arg("BatchMode=yes");
        if let Some(port) = self.port {
            cmd.arg(if scp_style { "-P" } else { "-p" })
                .arg(port.to_string());
        }
        if let Some(id) = self.identity_file.as_deref() {
            cmd.arg("-i").arg(id);
        }
        if let Some(kh) = self.known_hosts_file.as_deref() {
            cmd.arg("-o").arg(format!("UserKnownHostsFile={kh}"));
        }
        if matches!(self.strict_host_key_checking, Some(false)) {
            cmd.arg("-o").arg("StrictHostKeyChecking=no");
            if self.known_hosts_file.is_none() {
                cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
            }
        }
        cmd
    }
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl RemoteTarget for SshTarget {
    fn identify(&self) -> String {
        format!("ssh:{}", self.name)
    }

    fn required_tools(&self) -> Vec<String> {
        vec!["ssh".into(), "scp".into()]
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let mut cmd = self.command("ssh");
        cmd.arg(&self.host)
            .arg(format!("rm -f {}", sh_quote(&self.remote_abs(remote_path))));
        run_command_capture(cmd)
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let remote = self.remote_abs(&remote_object_path(
            remote_prefix,
            &local_file_name(local)?,
        ));
        if let Some((dir, _)) = remote.rsplit_once('/').filter(|(d, _)| !d.is_empty()) {
            let mut mkdir = self.command("ssh");
            mkdir.arg(&self.host).arg(format!("mkdir -p {}", sh_quote(dir)));
            run_command_capture(mkdir)?;
        }
        let mut scp = self.command("scp");
        scp.arg(local).arg(format!("{}:{remote}", self.host));
        run_command_capture(scp)
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let mut scp = self.command("scp");
        scp.arg(format!("{}:{}", self.host, self.remote_abs(remote_path)))
            .arg(local);
        run_command_capture(scp)
    }
}
