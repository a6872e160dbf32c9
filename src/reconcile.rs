//! Create-then-confirm reconciliation of a branch against GitHub.
//!
//! Creating a ref and listing branches are served by different consistency
//! domains on GitHub's side: a ref that was just created (or that the create
//! endpoint reports as already existing) may be missing from the branch list
//! for several seconds. GitHub offers no notification for this, so the
//! reconciler polls the branch list with cache-busting until the branch shows
//! up or a deadline passes:
//!
//! 1. Create: resolve the source branch, create the ref. "Already exists"
//!    is an alternate success path.
//! 2. Poll: cache-busted listing every `interval` until `timeout` has
//!    elapsed since polling began. Failed polls are retried.
//! 3. Grace check: one final listing after `grace_delay`, then give up.

use std::{
    fmt,
    time::{Duration, Instant},
};

use crate::github::{Branch, GitHubError, GitRefClient, RepoIdentifier};

/// Source of time for the polling loop.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

/// Wall clock backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two listings.
    pub interval: Duration,
    /// Polling budget, measured from the first listing.
    pub timeout: Duration,
    /// Delay before the last-chance listing once the budget is spent.
    pub grace_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
            grace_delay: Duration::from_secs(2),
        }
    }
}

/// Where a reconciliation currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilePhase {
    Idle,
    Creating { source: String },
    Polling { attempt: u32 },
    GraceCheck,
    Succeeded,
    TimedOut,
    Failed,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Creating { source } => write!(f, "creating branch from '{}'", source),
            Self::Polling { attempt } => {
                write!(f, "waiting for GitHub to list the branch (attempt {})", attempt)
            }
            Self::GraceCheck => write!(f, "final check"),
            Self::Succeeded => write!(f, "confirmed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Terminal result of one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// The branch was created and is now listed.
    Created { branch: Branch },
    /// The branch was already there and is now listed.
    AlreadyExisted { branch: Branch },
    /// The branch did not show up in the listing in time. It was most likely
    /// created and may still appear later.
    TimedOut {
        branch_name: String,
        elapsed: Duration,
    },
    Failed {
        branch_name: String,
        error: GitHubError,
    },
}

impl ReconciliationOutcome {
    pub fn branch_name(&self) -> &str {
        match self {
            Self::Created { branch } | Self::AlreadyExisted { branch } => &branch.name,
            Self::TimedOut { branch_name, .. } | Self::Failed { branch_name, .. } => branch_name,
        }
    }

    /// The branch, if it was confirmed present in a listing.
    pub fn confirmed_branch(&self) -> Option<&Branch> {
        match self {
            Self::Created { branch } | Self::AlreadyExisted { branch } => Some(branch),
            Self::TimedOut { .. } | Self::Failed { .. } => None,
        }
    }
}

impl fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created { branch } => write!(f, "Branch '{}' created", branch.name),
            Self::AlreadyExisted { branch } => {
                write!(f, "Branch '{}' already exists, switching to it", branch.name)
            }
            Self::TimedOut {
                branch_name,
                elapsed,
            } => write!(
                f,
                "Branch '{}' was created but GitHub has not listed it after {}s; it may still appear",
                branch_name,
                elapsed.as_secs()
            ),
            Self::Failed { branch_name, error } => {
                write!(f, "Failed to create branch '{}': {}", branch_name, error)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatePath {
    Created,
    AlreadyExisted,
}

#[derive(Debug)]
enum Visibility {
    Listed(Branch),
    NotListed { elapsed: Duration },
}

/// Drives create → poll → grace check against a [`GitRefClient`].
pub struct BranchReconciler<G, K = SystemClock> {
    client: G,
    clock: K,
    policy: PollPolicy,
}

impl<G: GitRefClient, K: Clock> BranchReconciler<G, K> {
    pub fn new(client: G, clock: K, policy: PollPolicy) -> Self {
        Self {
            client,
            clock,
            policy,
        }
    }

    pub fn client(&self) -> &G {
        &self.client
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    #[cfg(test)]
    pub fn reconcile(
        &self,
        repo: &RepoIdentifier,
        new_name: &str,
        source: Option<&str>,
    ) -> ReconciliationOutcome {
        self.reconcile_with_progress(repo, new_name, source, &mut |_| {})
    }

    /// Run one reconciliation, reporting each phase to `progress`.
    ///
    /// When `source` is `None` the repository's default branch is used.
    pub fn reconcile_with_progress(
        &self,
        repo: &RepoIdentifier,
        new_name: &str,
        source: Option<&str>,
        progress: &mut dyn FnMut(&ReconcilePhase),
    ) -> ReconciliationOutcome {
        let source = match source {
            Some(source) => source.to_string(),
            None => match self.client.default_branch(repo) {
                Ok(default_branch) => default_branch,
                Err(error) => return self.fail(new_name, error, progress),
            },
        };

        progress(&ReconcilePhase::Creating {
            source: source.clone(),
        });
        tracing::info!("Creating branch '{}' from '{}' in {}", new_name, source, repo);
        let path = match self.client.create_branch(repo, new_name, &source) {
            Ok(()) => CreatePath::Created,
            Err(GitHubError::AlreadyExists { .. }) => {
                tracing::info!("Branch '{}' already exists, confirming it is listed", new_name);
                CreatePath::AlreadyExisted
            }
            Err(error) => return self.fail(new_name, error, progress),
        };

        match self.poll_until_visible(repo, new_name, progress) {
            Ok(Visibility::Listed(branch)) => {
                progress(&ReconcilePhase::Succeeded);
                match path {
                    CreatePath::Created => ReconciliationOutcome::Created { branch },
                    CreatePath::AlreadyExisted => ReconciliationOutcome::AlreadyExisted { branch },
                }
            }
            Ok(Visibility::NotListed { elapsed }) => {
                tracing::warn!(
                    "Branch '{}' not listed after {:?}, giving up",
                    new_name,
                    elapsed
                );
                progress(&ReconcilePhase::TimedOut);
                ReconciliationOutcome::TimedOut {
                    branch_name: new_name.to_string(),
                    elapsed,
                }
            }
            Err(error) => self.fail(new_name, error, progress),
        }
    }

    /// Poll until `name` is listed. `elapsed` is measured from the first
    /// listing, not from the start of the reconciliation.
    fn poll_until_visible(
        &self,
        repo: &RepoIdentifier,
        name: &str,
        progress: &mut dyn FnMut(&ReconcilePhase),
    ) -> Result<Visibility, GitHubError> {
        let poll_start = self.clock.now();
        let mut attempt = 0;

        while self.clock.now().duration_since(poll_start) < self.policy.timeout {
            attempt += 1;
            progress(&ReconcilePhase::Polling { attempt });
            if let Some(branch) = self.check_listed(repo, name, attempt)? {
                tracing::info!("Branch '{}' listed after {} poll(s)", name, attempt);
                return Ok(Visibility::Listed(branch));
            }
            self.clock.sleep(self.policy.interval);
        }

        // Last chance for a branch that became visible right at the deadline.
        progress(&ReconcilePhase::GraceCheck);
        self.clock.sleep(self.policy.grace_delay);
        attempt += 1;
        match self.check_listed(repo, name, attempt)? {
            Some(branch) => Ok(Visibility::Listed(branch)),
            None => Ok(Visibility::NotListed {
                elapsed: self.clock.now().duration_since(poll_start),
            }),
        }
    }

    /// One cache-busted listing. Transient failures count as "not listed";
    /// a rejected credential aborts the whole operation.
    fn check_listed(
        &self,
        repo: &RepoIdentifier,
        name: &str,
        attempt: u32,
    ) -> Result<Option<Branch>, GitHubError> {
        match self.client.list_branches(repo, true) {
            Ok(branches) => Ok(branches.into_iter().find(|b| b.name == name)),
            Err(GitHubError::NotAuthenticated) => Err(GitHubError::NotAuthenticated),
            Err(error) => {
                tracing::warn!(attempt, "Polling for branch '{}' failed, retrying: {}", name, error);
                Ok(None)
            }
        }
    }

    fn fail(
        &self,
        new_name: &str,
        error: GitHubError,
        progress: &mut dyn FnMut(&ReconcilePhase),
    ) -> ReconciliationOutcome {
        tracing::warn!("Reconciling branch '{}' failed: {}", new_name, error);
        progress(&ReconcilePhase::Failed);
        ReconciliationOutcome::Failed {
            branch_name: new_name.to_string(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeClock, FakeGitHub, repo};

    fn reconciler<'a>(
        github: &'a FakeGitHub,
        clock: &'a FakeClock,
    ) -> BranchReconciler<&'a FakeGitHub, &'a FakeClock> {
        BranchReconciler::new(github, clock, PollPolicy::default())
    }

    #[test]
    fn created_branch_is_confirmed_by_listing() {
        let github = FakeGitHub::with_branches(&["main"]);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", None);

        assert_eq!(
            outcome,
            ReconciliationOutcome::Created {
                branch: Branch::new("docs")
            }
        );
        assert_eq!(github.creates(), vec![("docs".to_string(), "main".to_string())]);
        assert_eq!(github.list_calls(), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn succeeds_on_the_poll_where_branch_appears() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(5);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert!(matches!(outcome, ReconciliationOutcome::Created { .. }));
        assert_eq!(github.list_calls(), 5);
        assert_eq!(clock.elapsed(), Duration::from_secs(8));
    }

    #[test]
    fn times_out_after_timeout_plus_one_grace_check() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(100);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert_eq!(
            outcome,
            ReconciliationOutcome::TimedOut {
                branch_name: "docs".to_string(),
                elapsed: Duration::from_secs(32),
            }
        );
        // 15 polls at t = 0, 2, ..., 28 and the grace check at t = 32.
        assert_eq!(github.list_calls(), 16);
    }

    #[test]
    fn grace_check_catches_branch_at_the_deadline() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(16);
        let clock = FakeClock::new();
        let mut phases = Vec::new();

        let outcome = reconciler(&github, &clock).reconcile_with_progress(
            &repo(),
            "docs",
            Some("main"),
            &mut |phase| phases.push(phase.clone()),
        );

        assert!(matches!(outcome, ReconciliationOutcome::Created { .. }));
        assert_eq!(github.list_calls(), 16);
        assert_eq!(
            &phases[phases.len() - 2..],
            &[ReconcilePhase::GraceCheck, ReconcilePhase::Succeeded]
        );
    }

    #[test]
    fn timeout_is_measured_from_first_poll() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(100);
        let clock = FakeClock::new();
        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(35),
            grace_delay: Duration::from_millis(5),
        };
        // Time spent before polling does not eat into the budget.
        clock.sleep(Duration::from_secs(60));

        let outcome =
            BranchReconciler::new(&github, &clock, policy).reconcile(&repo(), "docs", Some("main"));

        assert_eq!(
            outcome,
            ReconciliationOutcome::TimedOut {
                branch_name: "docs".to_string(),
                elapsed: Duration::from_millis(45),
            }
        );
        assert_eq!(github.list_calls(), 5);
    }

    #[test]
    fn already_existing_branch_must_still_be_listed() {
        let github = FakeGitHub::with_branches(&["main"]).with_unlisted_ref("docs", 3);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert_eq!(
            outcome,
            ReconciliationOutcome::AlreadyExisted {
                branch: Branch::new("docs")
            }
        );
        assert_eq!(github.list_calls(), 3);
    }

    #[test]
    fn already_existing_branch_that_never_lists_times_out() {
        let github = FakeGitHub::with_branches(&["main"]).with_unlisted_ref("docs", 1000);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert!(matches!(outcome, ReconciliationOutcome::TimedOut { .. }));
    }

    #[test]
    fn transient_poll_failures_are_retried() {
        let github = FakeGitHub::with_branches(&["main"]).failing_lists(2);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert!(matches!(outcome, ReconciliationOutcome::Created { .. }));
        assert_eq!(github.list_calls(), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn rejected_credentials_abort_polling() {
        let github = FakeGitHub::with_branches(&["main"]).list_error(GitHubError::NotAuthenticated);
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", Some("main"));

        assert_eq!(
            outcome,
            ReconciliationOutcome::Failed {
                branch_name: "docs".to_string(),
                error: GitHubError::NotAuthenticated,
            }
        );
        assert_eq!(github.list_calls(), 1);
    }

    #[test]
    fn create_failure_is_terminal() {
        let error = GitHubError::Remote {
            status: 403,
            message: "Resource not accessible by integration".to_string(),
        };
        let github = FakeGitHub::with_branches(&["main"]).create_error(error.clone());
        let clock = FakeClock::new();
        let mut phases = Vec::new();

        let outcome = reconciler(&github, &clock).reconcile_with_progress(
            &repo(),
            "docs",
            Some("main"),
            &mut |phase| phases.push(phase.clone()),
        );

        assert_eq!(
            outcome,
            ReconciliationOutcome::Failed {
                branch_name: "docs".to_string(),
                error,
            }
        );
        assert_eq!(github.list_calls(), 0);
        assert_eq!(phases.last(), Some(&ReconcilePhase::Failed));
    }

    #[test]
    fn source_defaults_to_repository_default_branch() {
        let github = FakeGitHub::with_branches(&["trunk"]).default_branch_name("trunk");
        let clock = FakeClock::new();

        reconciler(&github, &clock).reconcile(&repo(), "docs", None);

        assert_eq!(github.creates(), vec![("docs".to_string(), "trunk".to_string())]);
    }

    #[test]
    fn default_branch_lookup_failure_fails_before_creating() {
        let github = FakeGitHub::with_branches(&["main"])
            .default_branch_error(GitHubError::Network("timed out".to_string()));
        let clock = FakeClock::new();

        let outcome = reconciler(&github, &clock).reconcile(&repo(), "docs", None);

        assert!(matches!(outcome, ReconciliationOutcome::Failed { .. }));
        assert!(github.creates().is_empty());
    }

    #[test]
    fn phases_are_reported_in_order() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(2);
        let clock = FakeClock::new();
        let mut phases = Vec::new();

        reconciler(&github, &clock).reconcile_with_progress(
            &repo(),
            "docs",
            None,
            &mut |phase| phases.push(phase.clone()),
        );

        assert_eq!(
            phases,
            vec![
                ReconcilePhase::Creating {
                    source: "main".to_string()
                },
                ReconcilePhase::Polling { attempt: 1 },
                ReconcilePhase::Polling { attempt: 2 },
                ReconcilePhase::Succeeded,
            ]
        );
    }

    #[test]
    fn near_zero_policy_runs_on_the_system_clock() {
        let github = FakeGitHub::with_branches(&["main"]).listed_on_poll(1000);
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(5),
            grace_delay: Duration::from_millis(1),
        };

        let outcome =
            BranchReconciler::new(&github, SystemClock, policy).reconcile(&repo(), "docs", None);

        match outcome {
            ReconciliationOutcome::TimedOut { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(6))
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[test]
    fn timed_out_message_names_branch_and_wait() {
        let outcome = ReconciliationOutcome::TimedOut {
            branch_name: "docs".to_string(),
            elapsed: Duration::from_secs(32),
        };
        let message = outcome.to_string();
        assert!(message.contains("'docs'"));
        assert!(message.contains("32s"));
    }
}
