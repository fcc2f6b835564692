//! run-task configuration, optionally loaded from a TOML file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Pinned host key of github.com, written to the checkout's `known_hosts`.
pub const GITHUB_KNOWN_HOST: &str = "github.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABgQCj7ndNxQowgcQnjshcLrqPEiiphnt+VTTvDP6mHBL9j1aNUkY4Ue1gvwnGLVlOhGeYrnZaMgRK6+PKCUXaDbC7qtbW8gIkhL7aGCsOr/C56SJMy/BCZfxd1nWzAOxSDPgVsmerOBYfNqltV9/hWCqBywINIR+5dIg6JTJ72pcEpEjcYgXkE2YEFXV1JHnsKgbLWNlhScqb2UmyRkQyytRLtL+38TGxkxCflmO+5Z8CSSNY7GidjMIZ7Q4zMjA2n1nGrlTDkzwDCsw+wqFPGQA179cnfGWOWRVruj16z6XyvxvjJwbz0wQZ75XK5tKSb7FNyeIEs4TT4jk+S4dhPeAUC5y+bDYirYgM4GC7uEnztnZyaVWQ7B381AK4Qdrwt51ZqExKbQpTUNn+EjqoTwvqNj4kqx5QUCI0ThS/YkOxJCXmPUWZbhjpCg56i+2aB6CmK2JGhn57K5mj0MNdBXA4/WnwH6XoPWJzK5Nyu2zB3nAZp+S5hpQs+p1vN1/wsjk=\n";

/// run-task configuration (TOML).
///
/// Every field has a default matching the Taskcluster worker layout, so the
/// file is optional. Values that differ between hosts or tests (helper
/// paths, pinned keys, endpoints) live here instead of in statics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunTaskConfig {
    /// Wall-clock limit for a single VCS client invocation.
    pub vcs_timeout_secs: u64,

    /// Truncate captured VCS output beyond this many bytes.
    pub vcs_output_limit_bytes: usize,

    /// Location of the fetch-content helper, relative to the primary checkout.
    pub fetch_content_path: PathBuf,

    /// Base URL of the secrets service; secret names are appended.
    pub secrets_base_url: String,

    /// `known_hosts` content provisioned for SSH checkouts.
    pub known_hosts: String,

    /// Secret holding the hg server fingerprints (`--fetch-hgfingerprint`).
    pub hg_fingerprint_secret: String,

    /// Host the fetched hg fingerprints apply to.
    pub hg_fingerprint_host: String,
}

impl Default for RunTaskConfig {
    fn default() -> Self {
        Self {
            vcs_timeout_secs: 60 * 60,
            vcs_output_limit_bytes: 1_000_000,
            fetch_content_path: PathBuf::from("taskcluster/scripts/misc/fetch-content"),
            secrets_base_url: "http://taskcluster/secrets/v1/secret".to_string(),
            known_hosts: GITHUB_KNOWN_HOST.to_string(),
            hg_fingerprint_secret: "project/taskcluster/gecko/hgfingerprint".to_string(),
            hg_fingerprint_host: "hg.mozilla.org".to_string(),
        }
    }
}

impl RunTaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.vcs_timeout_secs == 0 {
            return Err(anyhow!("vcs_timeout_secs must be > 0"));
        }
        if self.vcs_output_limit_bytes == 0 {
            return Err(anyhow!("vcs_output_limit_bytes must be > 0"));
        }
        if self.fetch_content_path.as_os_str().is_empty() || self.fetch_content_path.is_absolute()
        {
            return Err(anyhow!(
                "fetch_content_path must be a relative path inside the checkout"
            ));
        }
        if self.secrets_base_url.trim().is_empty() {
            return Err(anyhow!("secrets_base_url must not be empty"));
        }
        if self.known_hosts.trim().is_empty() {
            return Err(anyhow!("known_hosts must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// `None` returns `RunTaskConfig::default()`. A path that was given must
/// exist.
pub fn load_config(path: Option<&Path>) -> Result<RunTaskConfig> {
    let Some(path) = path else {
        let cfg = RunTaskConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    };
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunTaskConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
