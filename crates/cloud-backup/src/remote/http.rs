use std::fmt;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use super::{
    RemoteTarget, local_file_name, remote_object_path, resolve_required_string_field,
    resolve_string_field,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HttpTargetConfig {
    pub base_url: String,
    pub base_url_env: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    /// Per-request timeout; unset means no timeout.
    pub timeout_secs: Option<u64>,
}

/// Plain HTTP object store: `PUT` to upload, `DELETE` to remove, `GET` to
/// download, objects addressed as `<base_url>/<remote path>`.
#[derive(Clone)]
pub struct HttpTarget {
    name: String,
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl fmt::Debug for HttpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTarget")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpTarget {
    pub fn from_config(name: &str, cfg: &HttpTargetConfig) -> Result<Self> {
        let base_url = resolve_required_string_field(
            &format!("targets.http.{name}.base_url"),
            Some(cfg.base_url.as_str()),
            cfg.base_url_env.as_deref(),
        )?;
        let client = Client::builder()
            .timeout(cfg.timeout_secs.map(Duration::from_secs))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: resolve_string_field(cfg.token.as_deref(), cfg.token_env.as_deref()),
            client,
        })
    }

    fn url(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base_url, remote_path.trim_start_matches('/'))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

impl RemoteTarget for HttpTarget {
    fn identify(&self) -> String {
        format!("http:{}", self.name)
    }

    fn remove(&self, remote_path: &str) -> Result<()> {
        let url = self.url(remote_path);
        debug!(%url, "HTTP DELETE");
        let res = self
            .authed(self.client.delete(&url))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP delete failed: {e}")))?;
        if res.status().is_success() || res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Error::transfer(format!(
            "HTTP delete failed with status {}",
            res.status()
        )))
    }

    fn upload(&self, local: &Path, remote_prefix: &str) -> Result<()> {
        let url = self.url(&remote_object_path(remote_prefix, &local_file_name(local)?));
        let file = File::open(local)
            .map_err(|e| Error::transfer(format!("failed to open {}: {e}", local.display())))?;
        debug!(%url, "HTTP PUT");
        let res = self
            .authed(self.client.put(&url))
            .body(file)
            .send()
            .map_err(|e| Error::transfer(format!("HTTP upload failed: {e}")))?;
        if res.status().is_success() {
            return Ok(());
        }
        Err(Error::transfer(format!(
            "HTTP upload failed with status {}",
            res.status()
        )))
    }

    fn download(&self, remote_path: &str, local: &Path) -> Result<()> {
        let url = self.url(remote_path);
        debug!(%url, "HTTP GET");
        let mut res = self
            .authed(self.client.get(&url))
            .send()
            .map_err(|e| Error::transfer(format!("HTTP download failed: {e}")))?;
        if !res.status().is_success() {
            return Err(Error::transfer(format!(
                "HTTP download of {url} failed with status {}",
                res.status()
            )));
        }
        let mut out = File::create(local)
            .map_err(|e| Error::transfer(format!("failed to create {}: {e}", local.display())))?;
        if let Err(e) = res.copy_to(&mut out) {
            drop(out);
            let _ = fs::remove_file(local);
            return Err(Error::transfer(format!("HTTP body read failed: {e}")));
        }
        Ok(())
    }
}
