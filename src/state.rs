use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::github::RepoIdentifier;

const STATE_FILE: &str = "state.yaml";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct State {
    /// Keyed by `host/owner/repo`.
    #[serde(default)]
    pub repos: HashMap<String, RepoState>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    /// Unix timestamp of the last selection change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

fn repo_key(repo: &RepoIdentifier) -> String {
    format!("{}/{}/{}", repo.host, repo.owner, repo.repo)
}

impl State {
    pub fn selected_branch(&self, repo: &RepoIdentifier) -> Option<&str> {
        self.repos
            .get(&repo_key(repo))
            .and_then(|state| state.selected_branch.as_deref())
    }

    pub fn set_selected_branch(&mut self, repo: &RepoIdentifier, branch: Option<&str>) {
        let entry = self.repos.entry(repo_key(repo)).or_default();
        if entry.selected_branch.as_deref() == branch {
            return;
        }
        tracing::debug!(repo = %repo, ?branch, "Updating selected branch");
        entry.selected_branch = branch.map(str::to_string);
        entry.updated_at = Some(chrono::Utc::now().timestamp());
    }
}

/// Missing or empty files yield an empty state.
pub fn load_state_from(path: &Path) -> Result<State> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            tracing::debug!("No state file at {}, starting fresh", path.display());
            return Ok(State::default());
        }
        Err(error) => {
            return Err(error).with_context(|| format!("reading {}", path.display()));
        }
    };
    if data.trim().is_empty() {
        return Ok(State::default());
    }
    serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn save_state_to(state: &State, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tracing::debug!(?path, "Saving state");
    fs::write(path, serde_yaml::to_string(state)?)
        .with_context(|| format!("writing {}", path.display()))
}

pub fn load_state() -> Result<State> {
    match get_xdg_path() {
        Some(path) => load_state_from(&path),
        None => Ok(State::default()),
    }
}

pub fn save_state(state: &State) -> Result<()> {
    let base_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"));
    let path = base_dirs
        .place_state_file(STATE_FILE)
        .context("Failed to create state directory")?;
    save_state_to(state, &path)
}

fn get_xdg_path() -> Option<PathBuf> {
    xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME")).get_state_file(STATE_FILE)
}
