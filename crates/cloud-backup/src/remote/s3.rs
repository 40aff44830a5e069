use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;

use super::{
    RemoteTarget, local_file_name, remote_object_path, resolve_env_ref,
    resolve_required_string_field, resolve_string_field, run_command_capture,
};
use crate::error::Result;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct S3TargetConfig {
    pub bucket: String,
    pub bucket_env: Option<String>,
    pub region: Option<String>,
    pub region_env: Option<String>,
    pub prefix: Option<String>,
    pub prefix_env: Option<String>,
    pub endpoint_url: Option<String>,
    pub endpoint_url_env: Option<String>,
    pub profile: Option<String>,
    pub profile_env: Option<String>,
    pub aws_access_key_id_env: Option<String>,
    pub aws_secret_access_key_env: Option<String>,
    pub aws_session_token_env: Option<String>,
}

/// S3 (or S3-compatible) bucket driven through the `aws` CLI.
#[derive(Clone)]
pub struct S3Target {
    name: String,
    bucket: String,
    region: Option<String>,
    prefix: Option<String>,
    endpoint_url: Option<String>,
    profile: Option<String>,
    command_env: BTreeMap<String, String>,
}

// Forwarded credentials are listed by name only.
impl fmt::Debug for S3Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Target")
            .field("name", &self.name)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("endpoint_url", &self.endpoint_url)
            .field("profile", &self.profile)
            .field("command_env", &self.command_env.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl S3Target {
    pub fn from_config(name: &str, cfg: &S3TargetConfig) -> Result<Self> {
        let bucket = resolve_required_string_field(
            &format!("targets.s3.{name}.bucket"),
            Some(cfg.bucket.as_str()),
            cfg.bucket_env.as_deref(),
        )?;

        let mut command_env = BTreeMap::new();
        for (dst, src) in [
            ("AWS_ACCESS_KEY_ID", cfg.aws_access_key_id_env.as_deref()),
            (
                "AWS_SECRET_ACCESS_KEY",
                cfg.aws_secret_access_key_env.as_deref(),
            ),
            ("AWS_SESSION_TOKEN", cfg.aws_session_token_env.as_deref()),
        ] {
            if let Some(v) = resolve_env_ref(src) {
                command_env.insert(dst.to_string(), v);
            }
        }

        Ok(Self {
            name: name.to_string(),
            bucket,
            region: resolve_string_field(cfg.region.as_deref(), cfg.region_env.as_deref()),
            prefix: resolve_string_field(cfg.prefix.as_deref(), cfg.prefix_env.as_deref()),
            endpoint_url: resolve_string_field(
                cfg.endpoint_url.as_deref(),
                cfg.endpoint_url_env.as_deref(),
            ),
            profile: resolve_string_field(cfg.profile.as_deref(), cfg.profile_env.as_deref()),
            command_env,
        })
    }

    fn object_url(&self, remote_path: &str) -> String {
        let mut key = String::new();
        if let Some(prefix) = self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            if !prefix.is_empty() {
                key.push_str(prefix);
                key.push('/');
            }
        }
        key.push_str(remote_path.trim_start_matches('/'));
        format!("s3://{}/{key}", self.bucket)
    }

    fn aws(&self) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(profile) = self.profile.as_deref() {
            cmd.arg("--profile").arg(profile);
        }
        if let Some(region) = self.region.as_deref() {
            cmd.arg("--region").arg(region);
        }
        if let Some(endpoint) = self.endpoint_url.as_deref() {
            cmd.arg("--endpoint-url").arg(endpoint);
        }
        for (k, v) in &self.command_env {
            cmd.env(k, v);
        }
        cmd
    }
}

impl RemoteTarget for S3Target {
    fn identify(&self) -> String {
        format!("s3:{}", self.name)
    }

    fn required_tools(&self) -> Vec<String> {
        vec!["aws".into()]
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("s3").arg("rm").arg(self.object_url(remote_path));
        run_command_capture(cmd)
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let remote = remote_object_path(remote_prefix, &local_file_name(local)?);
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(local)
            .arg(self.object_url(&remote));
        run_command_capture(cmd)
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let mut cmd = self.aws();
        cmd.arg("s3")
            .arg("cp")
            .arg("--only-show-errors")
            .arg(self.object_url(remote_path))
            .arg(local);
        run_command_capture(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_env_fields_and_builds_keys() {
        unsafe {
            std::env::set_var("CLOUD_BACKUP_TEST_S3_BUCKET", "bucket-from-env");
            std::env::set_var("CLOUD_BACKUP_TEST_S3_KEY", "key-from-env");
        }
        let cfg = S3TargetConfig {
            bucket_env: Some("CLOUD_BACKUP_TEST_S3_BUCKET".into()),
            prefix: Some("/hosts/laptop/".into()),
            aws_access_key_id_env: Some("CLOUD_BACKUP_TEST_S3_KEY".into()),
            ..Default::default()
        };
        let t = S3Target::from_config("main", &cfg).expect("resolve");
        assert_eq!(t.identify(), "s3:main");
        assert_eq!(
            t.object_url("backups/abc.bin"),
            "s3://bucket-from-env/hosts/laptop/backups/abc.bin"
        );
        assert_eq!(
            t.command_env.get("AWS_ACCESS_KEY_ID").map(String::as_str),
            Some("key-from-env")
        );
    }

    #[test]
    fn forwarded_credentials_stay_out_of_debug_and_logs() {
        unsafe {
            std::env::set_var("CLOUD_BACKUP_TEST_S3_SECRET", "TOPSECRET123");
        }
        let cfg = S3TargetConfig {
            bucket: "b".into(),
            aws_secret_access_key_env: Some("CLOUD_BACKUP_TEST_S3_SECRET".into()),
            ..Default::default()
        };
        let t = S3Target::from_config("main", &cfg).expect("resolve");
        let mut cmd = t.aws();
        cmd.arg("s3").arg("rm").arg(t.object_url("x.bin"));
        let rendered = crate::log_sanitize::command_line(&cmd);
        assert_eq!(rendered, "aws s3 rm s3://b/x.bin");
        assert!(!format!("{t:?}").contains("TOPSECRET123"));
        assert!(format!("{t:?}").contains("AWS_SECRET_ACCESS_KEY"));
    }

    #[test]
    fn missing_bucket_is_config_error() {
        let err = S3Target::from_config("main", &S3TargetConfig::default()).expect_err("no bucket");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
