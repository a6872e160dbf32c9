//! Local git lookups, used to infer the repository and a token.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use git2::{Config, Repository};

pub const DEFAULT_REMOTE: &str = "origin";

/// URL of the `origin` remote of the repository containing the current directory.
pub fn origin_url() -> Result<String> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    remote_url(&cwd, DEFAULT_REMOTE)
}

pub fn remote_url(path: &Path, remote: &str) -> Result<String> {
    let repo = Repository::discover(path)
        .with_context(|| format!("No git repository at {}", path.display()))?;
    let found = repo
        .find_remote(remote)
        .with_context(|| format!("No remote named '{}'", remote))?;
    let url = found
        .url()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Remote '{}' has a non-UTF-8 URL", remote))?;
    tracing::debug!(%url, remote, "Resolved git remote");
    Ok(url)
}

/// A string value from the user's global git config.
pub fn config_string(key: &str) -> Option<String> {
    let config = Config::open_default()
        .inspect_err(|error| tracing::debug!("No git config: {}", error))
        .ok()?;
    config.get_string(key).ok()
}
