//! User configuration stored at `$XDG_CONFIG_HOME/docs-branch/github.yaml`.

use std::{collections::HashMap, fs, io::ErrorKind, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::reconcile::PollPolicy;

/// Branch created by `ensure-branch` when no name is given.
pub const DEFAULT_DOCS_BRANCH: &str = "docs";

const CONFIG_FILE: &str = "github.yaml";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_token: Option<String>,
    /// Per-host tokens, for GitHub Enterprise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_branch: Option<String>,
    #[serde(default)]
    pub poll: PollSettings,
}

/// Overrides for the branch visibility polling policy, in milliseconds.
#[derive(Debug, Default, Clone, Copy, Deserialize, Serialize)]
pub struct PollSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grace_delay_ms: Option<u64>,
}

impl PollSettings {
    pub fn to_policy(self) -> PollPolicy {
        let defaults = PollPolicy::default();
        PollPolicy {
            interval: self
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.interval),
            timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            grace_delay: self
                .grace_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.grace_delay),
        }
    }
}

impl ConfigFile {
    pub fn docs_branch(&self) -> &str {
        self.docs_branch
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_DOCS_BRANCH)
    }

    /// Host-specific token first, then the default token.
    pub fn token_for_host(&self, host: &str) -> Option<&str> {
        self.hosts
            .as_ref()
            .and_then(|hosts| hosts.get(host))
            .or(self.default_token.as_ref())
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }
}

pub fn parse_config(contents: &str) -> Result<ConfigFile> {
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}

/// Load the config file; a missing file yields the defaults.
pub fn load_config() -> Result<ConfigFile> {
    let Some(path) = config_path() else {
        return Ok(ConfigFile::default());
    };
    match fs::read_to_string(&path) {
        Ok(contents) => {
            parse_config(&contents).with_context(|| format!("parsing {}", path.display()))
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(error) => Err(error).with_context(|| format!("reading {}", path.display())),
    }
}

fn config_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME")).get_config_file(CONFIG_FILE)
}

/// Save a default token, preserving the rest of the config file
pub fn save_token(token: &str) -> Result<PathBuf> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    let config_path = base_dirs
        .place_config_file(CONFIG_FILE)
        .context("Failed to create config directory")?;

    let mut config = load_config().unwrap_or_default();
    config.default_token = Some(token.to_string());

    let contents = serde_yaml::to_string(&config)?;
    fs::write(&config_path, contents)
        .map_err(|e| anyhow!("writing {}: {}", config_path.display(), e))?;

    // Set restrictive permissions on the config file (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&config_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&config_path, perms)?;
    }

    Ok(config_path)
}
