//! Start-up probe for the external programs a run depends on.

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::PathSpec;
use crate::error::{Error, Result};

/// Programs needed to archive, restore and transfer `paths`.
pub fn required_tools<'a>(paths: impl IntoIterator<Item = &'a PathSpec>) -> BTreeSet<String> {
    let mut tools = BTreeSet::from(["tar".to_string()]);
    for p in paths {
        if p.compression {
            tools.insert("xz".into());
        }
        if p.encryption {
            tools.insert("gpg".into());
        }
        tools.extend(p.target.required_tools());
    }
    tools
}

/// Resolves `program` the way `Command` would: paths containing `/` are taken
/// as-is, anything else is searched on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return is_executable(&p).then_some(p);
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = p.metadata() else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Fails with `ToolMissing` naming every program not found.
pub fn probe<'a>(tools: impl IntoIterator<Item = &'a String>) -> Result<()> {
    let mut missing = Vec::new();
    for t in tools {
        match find_program(t) {
            Some(p) => debug!(tool = %t, at = %p.display(), "found tool"),
            None => missing.push(t.as_str()),
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::tool_missing(format!(
        "required command(s) not found: {}",
        missing.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::remote::{CommandTarget, CommandTargetConfig};
    use std::sync::Arc;

    #[test]
    fn collects_pipeline_and_target_tools() {
        let target = CommandTarget::from_config(
            "drive",
            &CommandTargetConfig {
                upload: "drive push -quiet {name}".into(),
                remove: "drive delete -quiet {remote}".into(),
                download: "drive pull -quiet {remote}".into(),
                ..Default::default()
            },
        )
        .expect("target");
        let mut plain = PathSpec::new(PathBuf::from("/a"), Arc::new(target));
        plain.compression = false;
        let mut secret = plain.clone();
        secret.path = PathBuf::from("/b");
        secret.compression = true;
        secret.encryption = true;

        let only_plain = required_tools([&plain]);
        assert_eq!(
            only_plain.iter().map(String::as_str).collect::<Vec<_>>(),
            ["drive", "tar"]
        );
        let both = required_tools([&plain, &secret]);
        assert_eq!(
            both.iter().map(String::as_str).collect::<Vec<_>>(),
            ["drive", "gpg", "tar", "xz"]
        );
    }

    #[test]
    fn probe_reports_missing_tools() {
        let tools = ["sh".to_string(), "cloud-backup-definitely-missing".to_string()];
        let err = probe(&tools).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ToolMissing);
        assert!(err.to_string().contains("cloud-backup-definitely-missing"));
        assert!(!err.to_string().contains("sh,"));
        assert!(find_program("sh").is_some());
    }
}
