use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use super::{RemoteTarget, local_file_name, remote_object_path, run_command_capture};
use crate::error::{Error, Result};

/// Argument templates for a user supplied transfer tool (`rclone`, `gsutil`,
/// a site script). Templates are split on whitespace and run without a shell;
/// placeholders are substituted inside each word:
///
/// - `{local}`: local archive path
/// - `{remote}`: full remote path (`{prefix}{name}`)
/// - `{prefix}`: remote directory, empty or ending in `/`
/// - `{name}`: object file name
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CommandTargetConfig {
    pub upload: String,
    pub remove: String,
    pub download: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct CommandTarget {
    name: String,
    upload: Vec<String>,
    remove: Vec<String>,
    download: Vec<String>,
    env: BTreeMap<String, String>,
}

// Env values often hold tokens; only the names are shown.
impl fmt::Debug for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTarget")
            .field("name", &self.name)
            .field("upload", &self.upload)
            .field("remove", &self.remove)
            .field("download", &self.download)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn parse_template(name: &str, op: &str, raw: &str) -> Result<Vec<String>> {
    let words = raw.split_whitespace().map(ToOwned::to_owned).collect::<Vec<_>>();
    if words.is_empty() {
        return Err(Error::config(format!(
            "targets.command.{name}.{op} must not be empty"
        )));
    }
    Ok(words)
}

struct Vars<'a> {
    local: &'a str,
    prefix: &'a str,
    name: &'a str,
}

impl Vars<'_> {
    fn render(&self, template: &[String]) -> Vec<String> {
        let remote = format!("{}{}", self.prefix, self.name);
        template
            .iter()
            .map(|w| {
                w.replace("{local}", self.local)
                    .replace("{remote}", &remote)
                    .replace("{prefix}", self.prefix)
                    .replace("{name}", self.name)
            })
            .collect()
    }
}

fn split_remote(remote_path: &str) -> (&str, &str) {
    match remote_path.rfind('/') {
        Some(i) => remote_path.split_at(i + 1),
        None => ("", remote_path),
    }
}

impl CommandTarget {
    pub fn from_config(name: &str, cfg: &CommandTargetConfig) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            upload: parse_template(name, "upload", &cfg.upload)?,
            remove: parse_template(name, "remove", &cfg.remove)?,
            download: parse_template(name, "download", &cfg.download)?,
            env: cfg.env.clone(),
        })
    }

    fn run(&self, argv: Vec<String>, cwd: Option<&Path>) -> Result<()> {
        let Some((program, args)) = argv.split_first() else {
            return Err(Error::transfer("empty command"));
        };
        let mut cmd = Command::new(program);
        cmd.args(args).envs(&self.env);
        if let Some(dir) = cwd.filter(|d| !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        run_command_capture(cmd)
    }
}

impl RemoteTarget for CommandTarget {
    fn identify(&self) -> String {
        format!("command:{}", self.name)
    }

    fn required_tools(&self) -> Vec<String> {
        let mut tools = [&self.upload, &self.remove, &self.download]
            .iter()
            .filter_map(|t| t.first().cloned())
            .collect::<Vec<_>>();
        tools.sort();
        tools.dedup();
        tools
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let (prefix, name) = split_remote(remote_path);
        let vars = Vars {
            local: "",
            prefix,
            name,
        };
        self.run(vars.render(&self.remove), None)
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let name = local_file_name(local)?;
        let remote = remote_object_path(remote_prefix, &name);
        let (prefix, _) = split_remote(&remote);
        let local_str = local.display().to_string();
        let vars = Vars {
            local: &local_str,
            prefix,
            name: &name,
        };
        self.run(vars.render(&self.upload), local.parent())
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let (prefix, name) = split_remote(remote_path);
        let local_str = local.display().to_string();
        let vars = Vars {
            local: &local_str,
            prefix,
            name,
        };
        self.run(vars.render(&self.download), local.parent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cp_target(store: &Path) -> CommandTarget {
        let s = store.display();
        CommandTarget::from_config(
            "cp",
            &CommandTargetConfig {
                upload: format!("cp {{local}} {s}/{{name}}"),
                remove: format!("rm -f {s}/{{name}}"),
                download: format!("cp {s}/{{name}} {{local}}"),
                env: BTreeMap::new(),
            },
        )
        .expect("target")
    }

    #[test]
    fn placeholders_render_per_word() {
        let vars = Vars {
            local: "/tmp/a b.bin",
            prefix: "backups/",
            name: "a.bin",
        };
        let argv = vars.render(&[
            "tool".into(),
            "put".into(),
            "{local}".into(),
            "remote:{remote}".into(),
        ]);
        assert_eq!(argv, ["tool", "put", "/tmp/a b.bin", "remote:backups/a.bin"]);
    }

    #[test]
    fn splits_remote_paths() {
        assert_eq!(split_remote("backups/x.bin"), ("backups/", "x.bin"));
        assert_eq!(split_remote("x.bin"), ("", "x.bin"));
    }

    #[test]
    fn required_tools_are_first_words() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(cp_target(tmp.path()).required_tools(), ["cp", "rm"]);
    }

    #[test]
    fn env_values_never_reach_errors_or_debug() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let local = tmp.path().join("a.bin");
        fs::write(&local, b"x").expect("write");
        let t = CommandTarget::from_config(
            "vault",
            &CommandTargetConfig {
                upload: "cloud-backup-no-such-tool put {local}".into(),
                remove: "cloud-backup-no-such-tool rm {remote}".into(),
                download: "cloud-backup-no-such-tool get {remote}".into(),
                env: BTreeMap::from([("VAULT_TOKEN".to_string(), "s.9f2c-secret".to_string())]),
            },
        )
        .expect("target");
        let err = t.upload(&local, "").expect_err("missing tool");
        assert_eq!(err.kind(), crate::error::ErrorKind::Transfer);
        assert!(!err.to_string().contains("s.9f2c-secret"), "{err}");
        let debug = format!("{t:?}");
        assert!(debug.contains("VAULT_TOKEN"));
        assert!(!debug.contains("s.9f2c-secret"));
    }

    #[test]
    fn empty_template_is_config_error() {
        let err = CommandTarget::from_config("x", &CommandTargetConfig::default())
            .expect_err("empty");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn runs_cp_and_rm() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = tmp.path().join("store");
        fs::create_dir(&store).expect("mkdir");
        let t = cp_target(&store);

        let local = tmp.path().join("abc.bin");
        fs::write(&local, b"payload").expect("write");
        t.upload(&local, "backups/").expect("upload");
        assert_eq!(fs::read(store.join("abc.bin")).expect("read"), b"payload");

        let back = tmp.path().join("back.bin");
        t.download("backups/abc.bin", &back).expect("download");
        assert_eq!(fs::read(&back).expect("read"), b"payload");

        t.remove("backups/abc.bin").expect("remove");
        assert!(!store.join("abc.bin").exists());
    }

    #[test]
    fn failing_command_is_transfer_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let t = cp_target(&tmp.path().join("missing-dir"));
        let local = tmp.path().join("abc.bin");
        fs::write(&local, b"payload").expect("write");
        let err = t.upload(&local, "").expect_err("cp fails");
        assert_eq!(err.kind(), crate::error::ErrorKind::Transfer);
    }
}
