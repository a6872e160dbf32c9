//! GitHub API client for branch and Markdown content operations.
//!
//! This module talks to the GitHub REST API directly over `ureq`. The
//! [`GitRefClient`] trait is the narrow seam the reconciler and the
//! selection controller depend on, so they can run against fakes in tests.

use std::{
    io::{self, Write},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use ureq::{
    Body,
    RequestBuilder,
    http::Response,
    typestate::{WithBody, WithoutBody},
};

use crate::{
    config, git,
    stats::{record_api_call, record_cache_bust},
};

/// Branch list page size (GitHub's maximum).
const PER_PAGE: usize = 100;

const USER_AGENT: &str = "docs-branch";
const API_VERSION: &str = "2022-11-28";

// ============== Configuration Types ==============

/// GitHub authentication configuration
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub api_base: String,
}

/// Repository identification (owner/repo, plus the host serving it)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoIdentifier {
    pub owner: String,
    pub repo: String,
    pub host: String,
}

impl RepoIdentifier {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            host: "github.com".to_string(),
        }
    }

    /// Returns the full repo path as "owner/repo"
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl std::fmt::Display for RepoIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

// ============== API Response Types ==============

/// A branch as reported by the branch list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Branch {
    pub name: String,
}

impl Branch {
    #[cfg(test)]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A repository the authenticated user can access.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserRepo {
    pub name: String,
    pub full_name: String,
    pub owner: RepoOwner,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoOwner {
    pub login: String,
}

impl UserRepo {
    /// Case-insensitive substring match on the repository name.
    pub fn matches(&self, term: &str) -> bool {
        self.name.to_lowercase().contains(&term.to_lowercase())
    }
}

#[derive(Debug, Deserialize)]
struct RepoDetails {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct BranchDetail {
    commit: CommitRef,
}

#[derive(Debug, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    ref_name: String,
    sha: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// Kind of an entry in a git tree listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    /// Submodule pointer.
    Commit,
}

/// One entry of a recursive tree listing.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Blob size in bytes; absent for trees.
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    sha: String,
}

/// Decoded file content together with the blob SHA needed to update it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub sha: String,
}

/// File update (commit) request
#[derive(Debug)]
pub struct UpdateFileRequest<'a> {
    pub path: &'a str,
    pub content: &'a str,
    /// Blob SHA of the file being replaced; `None` creates a new file.
    pub sha: Option<&'a str>,
    pub branch: &'a str,
    pub message: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ContentsUpdateBody<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct ContentsUpdateResponse {
    commit: CommitRef,
}

// ============== Error Types ==============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHubError {
    /// No token configured, or the token was rejected
    NotAuthenticated,
    /// The ref being created already exists
    AlreadyExists { branch: String },
    /// Rate limited (includes reset timestamp)
    RateLimited { reset_at: u64 },
    /// Transport-level failure (DNS, TLS, timeout, ...)
    Network(String),
    /// API error with status and message
    Remote { status: u16, message: String },
    /// Response did not have the expected shape
    InvalidResponse(String),
}

impl std::fmt::Display for GitHubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "Not authenticated with GitHub"),
            Self::AlreadyExists { branch } => write!(f, "Branch '{}' already exists", branch),
            Self::RateLimited { reset_at } => {
                write!(f, "GitHub API rate limited until {}", reset_at)
            }
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Remote { status, message } => {
                write!(f, "GitHub API error ({}): {}", status, message)
            }
            Self::InvalidResponse(msg) => write!(f, "Unexpected GitHub response: {}", msg),
        }
    }
}

impl std::error::Error for GitHubError {}

/// Map a non-success response to an error. Only authentication and rate
/// limiting are interpreted here; callers decide what a 422 means.
fn classify_failure(
    status: u16,
    rate_remaining: Option<&str>,
    rate_reset: Option<&str>,
    message: String,
) -> GitHubError {
    match status {
        401 => GitHubError::NotAuthenticated,
        403 | 429 if rate_remaining == Some("0") => GitHubError::RateLimited {
            reset_at: rate_reset.and_then(|r| r.parse().ok()).unwrap_or(0),
        },
        _ => GitHubError::Remote { status, message },
    }
}

fn is_ref_exists_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exists")
}

/// A query value that no intermediary cache has seen before.
fn cache_buster() -> String {
    format!(
        "{}-{:08x}",
        chrono::Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

/// Percent-encode each segment of a repository path or ref name, keeping the
/// `/` separators.
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(urlencoding::encode)
        .collect::<Vec<_>>()
        .join("/")
}

/// Decode a contents API payload (base64 with embedded line breaks).
fn decode_content(raw: &str) -> Result<String, GitHubError> {
    let compact: String = raw.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| GitHubError::InvalidResponse(format!("bad base64 content: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|_| GitHubError::InvalidResponse("file is not valid UTF-8".to_string()))
}

fn update_body<'a>(request: &UpdateFileRequest<'a>) -> ContentsUpdateBody<'a> {
    ContentsUpdateBody {
        message: request
            .message
            .filter(|m| !m.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Update {}", request.path)),
        content: STANDARD.encode(request.content),
        sha: request.sha,
        branch: request.branch,
    }
}

// ============== Ref Operations ==============

/// Remote ref operations needed to create and confirm a branch.
///
/// Implementations do no caching of their own.
pub trait GitRefClient {
    /// List all branches. With `bust_cache`, every request is constructed so
    /// that intermediary caches cannot answer it.
    fn list_branches(
        &self,
        repo: &RepoIdentifier,
        bust_cache: bool,
    ) -> Result<Vec<Branch>, GitHubError>;

    fn default_branch(&self, repo: &RepoIdentifier) -> Result<String, GitHubError>;

    /// Create `new_name` pointing at the current head of `source_name`.
    /// Returns [`GitHubError::AlreadyExists`] when the ref is already there.
    fn create_branch(
        &self,
        repo: &RepoIdentifier,
        new_name: &str,
        source_name: &str,
    ) -> Result<(), GitHubError>;
}

impl<T: GitRefClient + ?Sized> GitRefClient for &T {
    fn list_branches(
        &self,
        repo: &RepoIdentifier,
        bust_cache: bool,
    ) -> Result<Vec<Branch>, GitHubError> {
        (**self).list_branches(repo, bust_cache)
    }

    fn default_branch(&self, repo: &RepoIdentifier) -> Result<String, GitHubError> {
        (**self).default_branch(repo)
    }

    fn create_branch(
        &self,
        repo: &RepoIdentifier,
        new_name: &str,
        source_name: &str,
    ) -> Result<(), GitHubError> {
        (**self).create_branch(repo, new_name, source_name)
    }
}

// ============== Client ==============

/// GitHub API client
pub struct GitHubClient {
    config: GitHubConfig,
    agent: ureq::Agent,
}

impl GitHubClient {
    pub fn new(config: GitHubConfig) -> Self {
        // Status codes are inspected by hand so error bodies can be read.
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(30)))
            .build()
            .into();
        Self { config, agent }
    }

    /// Load the token from environment/git config/config file
    pub fn from_env(repo_id: &RepoIdentifier) -> Result<Self, GitHubError> {
        Self::for_host(&repo_id.host)
    }

    pub fn for_host(host: &str) -> Result<Self, GitHubError> {
        let token = find_github_token(host)?;
        Ok(Self::new(GitHubConfig {
            token,
            api_base: api_base_for_host(host),
        }))
    }

    fn repo_url(&self, repo: &RepoIdentifier, rest: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.config.api_base, repo.owner, repo.repo, rest
        )
    }

    fn with_headers<B>(&self, request: RequestBuilder<B>) -> RequestBuilder<B> {
        request
            .header("Authorization", &format!("Bearer {}", self.config.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", USER_AGENT)
    }

    fn get(&self, url: &str) -> RequestBuilder<WithoutBody> {
        self.with_headers(self.agent.get(url))
    }

    fn call(
        &self,
        endpoint: &'static str,
        request: RequestBuilder<WithoutBody>,
    ) -> Result<Response<Body>, GitHubError> {
        let start = Instant::now();
        let result = self.check(endpoint, request.call());
        record_api_call(endpoint, start.elapsed(), result.is_ok());
        result
    }

    fn send_json<T: Serialize>(
        &self,
        endpoint: &'static str,
        request: RequestBuilder<WithBody>,
        body: &T,
    ) -> Result<Response<Body>, GitHubError> {
        let start = Instant::now();
        let result = self.check(endpoint, request.send_json(body));
        record_api_call(endpoint, start.elapsed(), result.is_ok());
        result
    }

    fn check(
        &self,
        endpoint: &'static str,
        result: Result<Response<Body>, ureq::Error>,
    ) -> Result<Response<Body>, GitHubError> {
        let mut response = result.map_err(|e| GitHubError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let rate_remaining = header("x-ratelimit-remaining");
        let rate_reset = header("x-ratelimit-reset");
        let text = response.body_mut().read_to_string().unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&text)
            .map(|body| body.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());

        tracing::debug!(endpoint, status = status.as_u16(), %message, "GitHub request failed");
        Err(classify_failure(
            status.as_u16(),
            rate_remaining.as_deref(),
            rate_reset.as_deref(),
            message,
        ))
    }

    fn read_json<T: DeserializeOwned>(response: &mut Response<Body>) -> Result<T, GitHubError> {
        response
            .body_mut()
            .read_json()
            .map_err(|e| GitHubError::InvalidResponse(e.to_string()))
    }

    /// Resolve a branch name to the SHA of its head commit
    pub fn branch_head(&self, repo: &RepoIdentifier, branch: &str) -> Result<String, GitHubError> {
        let url = self.repo_url(repo, &format!("/branches/{}", encode_path(branch)));
        let mut response = self.call("branch", self.get(&url))?;
        let detail: BranchDetail = Self::read_json(&mut response)?;
        Ok(detail.commit.sha)
    }

    /// Fetch the recursive tree of a branch
    pub fn tree(&self, repo: &RepoIdentifier, branch: &str) -> Result<Vec<TreeEntry>, GitHubError> {
        let url = self.repo_url(repo, &format!("/git/trees/{}", encode_path(branch)));
        let mut response = self.call("tree", self.get(&url).query("recursive", "1"))?;
        let tree: TreeResponse = Self::read_json(&mut response)?;
        if tree.truncated {
            tracing::warn!(
                "Tree for {}@{} was truncated by GitHub; some files are missing",
                repo,
                branch
            );
        }
        Ok(tree.tree)
    }

    /// Fetch and decode a file on the given branch
    pub fn file_content(
        &self,
        repo: &RepoIdentifier,
        path: &str,
        branch: &str,
    ) -> Result<FileContent, GitHubError> {
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(path)));
        let mut response = self.call("contents", self.get(&url).query("ref", branch))?;
        let value: serde_json::Value = Self::read_json(&mut response)?;
        if value.is_array() {
            return Err(GitHubError::InvalidResponse(format!(
                "'{}' is a directory",
                path
            )));
        }
        let contents: ContentsResponse = serde_json::from_value(value)
            .map_err(|e| GitHubError::InvalidResponse(e.to_string()))?;
        if contents.kind != "file" {
            return Err(GitHubError::InvalidResponse(format!(
                "'{}' is a {}, not a file",
                path, contents.kind
            )));
        }
        if let Some(encoding) = contents.encoding.as_deref()
            && encoding != "base64"
        {
            return Err(GitHubError::InvalidResponse(format!(
                "unsupported content encoding '{}'",
                encoding
            )));
        }
        let content = decode_content(contents.content.as_deref().unwrap_or_default())?;
        Ok(FileContent {
            path: path.to_string(),
            content,
            sha: contents.sha,
        })
    }

    /// Commit new content for a file; returns the new commit SHA
    pub fn update_file(
        &self,
        repo: &RepoIdentifier,
        request: UpdateFileRequest,
    ) -> Result<String, GitHubError> {
        let url = self.repo_url(repo, &format!("/contents/{}", encode_path(request.path)));
        let body = update_body(&request);
        let put = self.with_headers(self.agent.put(&url));
        let mut response = self.send_json("update-contents", put, &body)?;
        let updated: ContentsUpdateResponse = Self::read_json(&mut response)?;
        Ok(updated.commit.sha)
    }

    /// List every repository the token's user can access, most recently
    /// updated first
    pub fn list_user_repos(&self) -> Result<Vec<UserRepo>, GitHubError> {
        let mut repos = Vec::new();
        let mut page = 1;

        loop {
            let url = format!("{}/user/repos", self.config.api_base);
            let request = self
                .get(&url)
                .query("sort", "updated")
                .query("per_page", PER_PAGE.to_string())
                .query("page", page.to_string());

            let mut response = self.call("user-repos", request)?;
            let batch: Vec<UserRepo> = Self::read_json(&mut response)?;

            let count = batch.len();
            repos.extend(batch);

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        tracing::debug!(count = repos.len(), "Listed repositories");
        Ok(repos)
    }
}

impl GitRefClient for GitHubClient {
    fn list_branches(
        &self,
        repo: &RepoIdentifier,
        bust_cache: bool,
    ) -> Result<Vec<Branch>, GitHubError> {
        let mut branches = Vec::new();
        let mut page = 1;

        loop {
            let url = self.repo_url(repo, "/branches");
            let mut request = self
                .get(&url)
                .query("per_page", PER_PAGE.to_string())
                .query("page", page.to_string());
            if bust_cache {
                record_cache_bust();
                request = request
                    .query("t", cache_buster())
                    .header("Cache-Control", "no-cache")
                    .header("Pragma", "no-cache");
            }

            let mut response = self.call("branches", request)?;
            let batch: Vec<Branch> = Self::read_json(&mut response)?;

            let count = batch.len();
            branches.extend(batch);

            // If we got fewer than per_page results, we've reached the end
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        tracing::debug!(
            repo = %repo,
            bust_cache,
            count = branches.len(),
            "Listed branches"
        );
        Ok(branches)
    }

    fn default_branch(&self, repo: &RepoIdentifier) -> Result<String, GitHubError> {
        let url = self.repo_url(repo, "");
        let mut response = self.call("repo", self.get(&url))?;
        let details: RepoDetails = Self::read_json(&mut response)?;
        Ok(details.default_branch)
    }

    fn create_branch(
        &self,
        repo: &RepoIdentifier,
        new_name: &str,
        source_name: &str,
    ) -> Result<(), GitHubError> {
        let sha = self.branch_head(repo, source_name)?;
        tracing::debug!("Creating ref refs/heads/{} at {} ({})", new_name, sha, source_name);

        let url = self.repo_url(repo, "/git/refs");
        let request = CreateRefRequest {
            ref_name: format!("refs/heads/{}", new_name),
            sha: &sha,
        };
        let post = self.with_headers(self.agent.post(&url));
        match self.send_json("create-ref", post, &request) {
            Ok(_) => Ok(()),
            Err(GitHubError::Remote { status: 422, message }) if is_ref_exists_message(&message) => {
                Err(GitHubError::AlreadyExists {
                    branch: new_name.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

// ============== Helper Functions ==============

fn api_base_for_host(host: &str) -> String {
    if host == "github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("https://{}/api/v3", host)
    }
}

/// Parse GitHub remote URL to extract owner/repo
pub fn parse_remote_url(url: &str) -> Result<RepoIdentifier> {
    // Handle various URL formats:
    // - git@github.com:owner/repo.git
    // - https://github.com/owner/repo.git
    // - https://github.com/owner/repo
    // - ssh://git@github.com/owner/repo.git
    // - git://github.com/owner/repo.git

    let url = url.trim();

    // SSH format: git@github.com:owner/repo.git
    if let Some(rest) = url.strip_prefix("git@")
        && let Some((host, path)) = rest.split_once(':')
        && let Some(repo_id) = split_owner_repo(host, path)
    {
        return Ok(repo_id);
    }

    let without_protocol = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("ssh://git@"))
        .or_else(|| url.strip_prefix("ssh://"))
        .or_else(|| url.strip_prefix("git://"));
    if let Some(rest) = without_protocol
        && let Some((host, path)) = rest.split_once('/')
        && let Some(repo_id) = split_owner_repo(host, path)
    {
        return Ok(repo_id);
    }

    bail!(
        "Could not parse GitHub remote URL: {}. Expected format like 'git@github.com:owner/repo.git' or 'https://github.com/owner/repo'",
        url
    )
}

fn split_owner_repo(host: &str, path: &str) -> Option<RepoIdentifier> {
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let (owner, repo) = path.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some(RepoIdentifier {
        host: host.to_string(),
        ..RepoIdentifier::new(owner, repo)
    })
}

/// Resolve the repository from `owner/repo`, a remote URL, or the `origin`
/// remote of the current checkout.
pub fn resolve_repo(arg: Option<&str>) -> Result<RepoIdentifier> {
    match arg {
        Some(arg) if arg.contains("://") || arg.starts_with("git@") => parse_remote_url(arg),
        Some(arg) => split_owner_repo("github.com", arg)
            .with_context(|| format!("Expected 'owner/repo', got '{}'", arg)),
        None => {
            let url = git::origin_url().context("No --repo given and no usable origin remote")?;
            parse_remote_url(&url)
        }
    }
}

/// Find a GitHub token from the environment, git config or the config file
fn find_github_token(host: &str) -> Result<String, GitHubError> {
    // 1. Check GITHUB_TOKEN env var
    if let Ok(token) = std::env::var("GITHUB_TOKEN")
        && !token.is_empty()
    {
        tracing::debug!("Using GitHub token from GITHUB_TOKEN env var");
        return Ok(token);
    }

    // 2. Check GH_TOKEN env var (used by gh CLI)
    if let Ok(token) = std::env::var("GH_TOKEN")
        && !token.is_empty()
    {
        tracing::debug!("Using GitHub token from GH_TOKEN env var");
        return Ok(token);
    }

    // 3. Check git config github.token
    if let Some(token) = git::config_string("github.token")
        && !token.is_empty()
    {
        tracing::debug!("Using GitHub token from git config");
        return Ok(token);
    }

    // 4. Check the config file (host-specific first, then default)
    match config::load_config() {
        Ok(config) => {
            if let Some(token) = config.token_for_host(host) {
                tracing::debug!("Using GitHub token from config file");
                return Ok(token.to_string());
            }
        }
        Err(error) => tracing::warn!("Ignoring unreadable config file: {:#}", error),
    }

    Err(GitHubError::NotAuthenticated)
}

/// Interactive token setup
pub fn setup_github_token_interactive() -> Result<String> {
    println!("docs-branch needs a GitHub Personal Access Token to read and write branches.");
    println!();
    println!("Steps to create a token:");
    println!("1. Go to: https://github.com/settings/tokens/new");
    println!("2. Name: \"docs-branch\"");
    println!("3. Scopes needed: repo (to create branches and commit files)");
    println!("4. Click \"Generate token\" and copy the value");
    println!();
    print!("Enter your token: ");
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin().read_line(&mut token)?;
    let token = token.trim().to_string();

    if token.is_empty() {
        bail!("No token provided");
    }

    let path = config::save_token(&token)?;
    println!("Token saved to {}", path.display());
    Ok(token)
}
