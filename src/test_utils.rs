//! Fakes shared by the reconciler and selection controller tests.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, mpsc},
    time::{Duration, Instant},
};

use crate::{
    github::{Branch, GitHubError, GitRefClient, RepoIdentifier},
    reconcile::Clock,
};

pub fn repo() -> RepoIdentifier {
    RepoIdentifier::new("acme", "handbook")
}

/// Clock whose `sleep` advances virtual time instantly.
pub struct FakeClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }
}

#[derive(Default)]
struct FakeRemote {
    /// Branches returned by listings, in order.
    listed: Vec<String>,
    /// Refs that exist but are not listed yet, with the number of listings
    /// that will still miss them.
    unlisted: Vec<(String, u32)>,
    /// Listings a newly created ref misses before it shows up.
    lag: u32,
    default_branch: String,
    failing_lists: u32,
    list_error: Option<GitHubError>,
    create_error: Option<GitHubError>,
    default_branch_error: Option<GitHubError>,
    list_calls: u32,
    creates: Vec<(String, String)>,
}

/// Scriptable in-memory stand-in for the GitHub ref endpoints.
pub struct FakeGitHub {
    remote: Mutex<FakeRemote>,
    holds: Mutex<HashMap<String, mpsc::Receiver<()>>>,
    list_hold: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FakeGitHub {
    pub fn with_branches(names: &[&str]) -> Self {
        Self {
            remote: Mutex::new(FakeRemote {
                listed: names.iter().map(|n| n.to_string()).collect(),
                default_branch: "main".to_string(),
                ..FakeRemote::default()
            }),
            holds: Mutex::new(HashMap::new()),
            list_hold: Mutex::new(None),
        }
    }

    fn remote(&self) -> MutexGuard<'_, FakeRemote> {
        self.remote.lock().unwrap()
    }

    /// A newly created ref first shows up on the `n`th listing after creation.
    pub fn listed_on_poll(self, n: u32) -> Self {
        self.remote().lag = n.saturating_sub(1);
        self
    }

    /// A ref that already exists but is listed only from the `n`th listing on.
    pub fn with_unlisted_ref(self, name: &str, n: u32) -> Self {
        self.remote()
            .unlisted
            .push((name.to_string(), n.saturating_sub(1)));
        self
    }

    /// The next `n` listings fail with a network error.
    pub fn failing_lists(self, n: u32) -> Self {
        self.remote().failing_lists = n;
        self
    }

    pub fn list_error(self, error: GitHubError) -> Self {
        self.remote().list_error = Some(error);
        self
    }

    pub fn create_error(self, error: GitHubError) -> Self {
        self.remote().create_error = Some(error);
        self
    }

    pub fn default_branch_error(self, error: GitHubError) -> Self {
        self.remote().default_branch_error = Some(error);
        self
    }

    pub fn default_branch_name(self, name: &str) -> Self {
        self.remote().default_branch = name.to_string();
        self
    }

    /// Block `create_branch(name)` until the returned sender fires (or drops).
    pub fn hold_create(&self, name: &str) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.holds.lock().unwrap().insert(name.to_string(), rx);
        tx
    }

    /// Block the next `list_branches` call, after it has been counted, until
    /// the returned sender fires (or drops).
    pub fn hold_list(&self) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.list_hold.lock().unwrap() = Some(rx);
        tx
    }

    pub fn list_calls(&self) -> u32 {
        self.remote().list_calls
    }

    /// `(new, source)` pairs passed to `create_branch`.
    pub fn creates(&self) -> Vec<(String, String)> {
        self.remote().creates.clone()
    }
}

impl GitRefClient for FakeGitHub {
    fn list_branches(
        &self,
        _repo: &RepoIdentifier,
        _bust_cache: bool,
    ) -> Result<Vec<Branch>, GitHubError> {
        self.remote().list_calls += 1;
        let hold = self.list_hold.lock().unwrap().take();
        if let Some(hold) = hold {
            let _ = hold.recv();
        }

        let mut remote = self.remote();
        if let Some(error) = remote.list_error.clone() {
            return Err(error);
        }
        if remote.failing_lists > 0 {
            remote.failing_lists -= 1;
            return Err(GitHubError::Network("connection reset".to_string()));
        }

        let mut still_unlisted = Vec::new();
        for (name, misses) in std::mem::take(&mut remote.unlisted) {
            if misses == 0 {
                remote.listed.push(name);
            } else {
                still_unlisted.push((name, misses - 1));
            }
        }
        remote.unlisted = still_unlisted;

        Ok(remote.listed.iter().map(Branch::new).collect())
    }

    fn default_branch(&self, _repo: &RepoIdentifier) -> Result<String, GitHubError> {
        let remote = self.remote();
        match remote.default_branch_error.clone() {
            Some(error) => Err(error),
            None => Ok(remote.default_branch.clone()),
        }
    }

    fn create_branch(
        &self,
        _repo: &RepoIdentifier,
        new_name: &str,
        source_name: &str,
    ) -> Result<(), GitHubError> {
        let hold = self.holds.lock().unwrap().remove(new_name);
        if let Some(hold) = hold {
            let _ = hold.recv();
        }

        let mut remote = self.remote();
        remote
            .creates
            .push((new_name.to_string(), source_name.to_string()));
        if let Some(error) = remote.create_error.clone() {
            return Err(error);
        }
        if !remote.listed.iter().any(|n| n == source_name) {
            return Err(GitHubError::Remote {
                status: 404,
                message: "Branch not found".to_string(),
            });
        }
        let exists = remote.listed.iter().any(|n| n == new_name)
            || remote.unlisted.iter().any(|(n, _)| n == new_name);
        if exists {
            return Err(GitHubError::AlreadyExists {
                branch: new_name.to_string(),
            });
        }
        let lag = remote.lag;
        remote.unlisted.push((new_name.to_string(), lag));
        Ok(())
    }
}
