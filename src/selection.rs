//! Branch selection with stale-response suppression.
//!
//! [`SelectionController`] owns the only mutable shared state: the selected
//! branch, the generation counter and the latest branch list snapshot.
//! Every reconciliation is tagged with a generation; a result is applied only
//! if its generation is still the newest one issued, and at most once. Older
//! operations may finish later than newer ones, but can never overwrite them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::{
    github::{Branch, GitHubError, GitRefClient, RepoIdentifier},
    reconcile::{BranchReconciler, Clock, ReconcilePhase, ReconciliationOutcome, SystemClock},
};

/// Branch names preferred when nothing else decides the selection.
const FALLBACK_BRANCHES: [&str; 2] = ["main", "master"];

/// An immutable branch listing. Newer fetches produce new snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchListSnapshot {
    repo: RepoIdentifier,
    branches: Vec<Branch>,
    fetched_at: DateTime<Utc>,
    sequence: u64,
}

impl BranchListSnapshot {
    fn new(repo: RepoIdentifier, branches: Vec<Branch>, sequence: u64) -> Self {
        Self {
            repo,
            branches,
            fetched_at: Utc::now(),
            sequence,
        }
    }

    pub fn repo(&self) -> &RepoIdentifier {
        &self.repo
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Fetch order; higher is newer.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn contains(&self, name: &str) -> bool {
        self.branches.iter().any(|b| b.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRequest {
    pub generation: u64,
    pub target_branch: String,
    /// `None` means the repository's default branch.
    pub source_branch: Option<String>,
    pub repo: RepoIdentifier,
}

/// What happened to an outcome handed to [`SelectionController::deliver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The outcome was current and has been applied.
    Applied {
        outcome: ReconciliationOutcome,
        selected: Option<String>,
    },
    /// A newer request was issued; the outcome had no effect.
    Superseded { outcome: ReconciliationOutcome },
    /// This generation was already applied; the outcome had no effect.
    Duplicate { outcome: ReconciliationOutcome },
}

impl Delivery {
    pub fn outcome(&self) -> &ReconciliationOutcome {
        match self {
            Self::Applied { outcome, .. }
            | Self::Superseded { outcome }
            | Self::Duplicate { outcome } => outcome,
        }
    }
}

/// Pick the branch to select from a listing: the explicit target, else the
/// previous selection, else `main`/`master`, else the first branch.
pub fn choose_branch(
    branches: &[Branch],
    explicit: Option<&str>,
    previous: Option<&str>,
) -> Option<String> {
    let listed = |name: &str| branches.iter().any(|b| b.name == name);

    explicit
        .filter(|name| listed(*name))
        .or_else(|| previous.filter(|name| listed(*name)))
        .map(str::to_string)
        .or_else(|| {
            branches
                .iter()
                .find(|b| FALLBACK_BRANCHES.contains(&b.name.as_str()))
                .map(|b| b.name.clone())
        })
        .or_else(|| branches.first().map(|b| b.name.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Current,
    Superseded,
    Duplicate,
}

#[derive(Debug, Default)]
struct SelectionState {
    generation: u64,
    last_applied: u64,
    fetch_sequence: u64,
    selected: Option<String>,
    snapshot: Option<Arc<BranchListSnapshot>>,
}

impl SelectionState {
    fn admit(&self, generation: u64) -> Admission {
        if generation != self.generation {
            Admission::Superseded
        } else if generation == self.last_applied {
            Admission::Duplicate
        } else {
            Admission::Current
        }
    }

    fn next_fetch(&mut self) -> u64 {
        self.fetch_sequence += 1;
        self.fetch_sequence
    }

    /// Install `snapshot` unless a newer one is already held, then re-run the
    /// selection rule against whichever snapshot is current.
    fn install(&mut self, snapshot: Arc<BranchListSnapshot>, explicit: Option<&str>) {
        let newer = self
            .snapshot
            .as_ref()
            .is_none_or(|held| held.sequence() < snapshot.sequence());
        if newer {
            self.snapshot = Some(snapshot);
        }
        if let Some(current) = &self.snapshot {
            self.selected = choose_branch(&current.branches, explicit, self.selected.as_deref());
        }
    }
}

/// Holds the selected branch and applies reconciliation outcomes in
/// generation order.
pub struct SelectionController<G, K = SystemClock> {
    reconciler: BranchReconciler<G, K>,
    repo: RepoIdentifier,
    state: Mutex<SelectionState>,
}

impl<G: GitRefClient, K: Clock> SelectionController<G, K> {
    pub fn new(reconciler: BranchReconciler<G, K>, repo: RepoIdentifier) -> Self {
        Self {
            reconciler,
            repo,
            state: Mutex::new(SelectionState::default()),
        }
    }

    /// Seed the selection, e.g. from persisted state. It is kept only while
    /// later listings still contain it.
    pub fn with_selection(mut self, selected: Option<String>) -> Self {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .selected = selected;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SelectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reconciler(&self) -> &BranchReconciler<G, K> {
        &self.reconciler
    }

    pub fn repo(&self) -> &RepoIdentifier {
        &self.repo
    }

    pub fn selected(&self) -> Option<String> {
        self.lock().selected.clone()
    }

    pub fn snapshot(&self) -> Option<Arc<BranchListSnapshot>> {
        self.lock().snapshot.clone()
    }

    pub fn current_generation(&self) -> u64 {
        self.lock().generation
    }

    /// Issue a new request, superseding every earlier one.
    pub fn issue(&self, target: &str, source: Option<&str>) -> ReconciliationRequest {
        let mut state = self.lock();
        state.generation += 1;
        ReconciliationRequest {
            generation: state.generation,
            target_branch: target.to_string(),
            source_branch: source.map(str::to_string),
            repo: self.repo.clone(),
        }
    }

    /// Issue a request for `target`, run the reconciler and deliver its
    /// outcome. The lock is not held while the reconciler talks to GitHub.
    pub fn request_reconciliation(
        &self,
        target: &str,
        source: Option<&str>,
        progress: &mut dyn FnMut(&ReconcilePhase),
    ) -> Result<Delivery, GitHubError> {
        let request = self.issue(target, source);
        tracing::debug!(
            generation = request.generation,
            "Reconciliation requested for '{}'",
            target
        );
        let outcome = self.reconciler.reconcile_with_progress(
            &request.repo,
            &request.target_branch,
            request.source_branch.as_deref(),
            progress,
        );
        self.deliver(&request, outcome)
    }

    /// Apply `outcome` if `request` is still the current one.
    ///
    /// A confirmed branch triggers a cache-busted refresh of the branch list
    /// and is then selected. The generation is checked again after the
    /// refresh, since a newer request may have been issued in the meantime.
    pub fn deliver(
        &self,
        request: &ReconciliationRequest,
        outcome: ReconciliationOutcome,
    ) -> Result<Delivery, GitHubError> {
        let sequence = {
            let mut state = self.lock();
            match state.admit(request.generation) {
                Admission::Current => {}
                rejected => return Ok(Self::rejected(request, rejected, outcome)),
            }
            if outcome.confirmed_branch().is_none() {
                state.last_applied = request.generation;
                let selected = state.selected.clone();
                return Ok(Delivery::Applied { outcome, selected });
            }
            state.next_fetch()
        };

        let branches = self.reconciler.client().list_branches(&self.repo, true)?;

        let mut state = self.lock();
        match state.admit(request.generation) {
            Admission::Current => {}
            rejected => return Ok(Self::rejected(request, rejected, outcome)),
        }
        state.last_applied = request.generation;
        let snapshot = Arc::new(BranchListSnapshot::new(self.repo.clone(), branches, sequence));
        state.install(snapshot, Some(outcome.branch_name()));
        if state.selected.as_deref() != Some(outcome.branch_name()) {
            tracing::warn!(
                "Branch '{}' was confirmed but is missing from the refreshed list; selected {:?}",
                outcome.branch_name(),
                state.selected
            );
        }
        let selected = state.selected.clone();
        Ok(Delivery::Applied { outcome, selected })
    }

    fn rejected(
        request: &ReconciliationRequest,
        admission: Admission,
        outcome: ReconciliationOutcome,
    ) -> Delivery {
        tracing::debug!(
            generation = request.generation,
            ?admission,
            "Discarding outcome for '{}'",
            request.target_branch
        );
        match admission {
            Admission::Duplicate => Delivery::Duplicate { outcome },
            _ => Delivery::Superseded { outcome },
        }
    }

    /// Re-list branches and re-run the selection rule. Returns `None` when a
    /// newer request was issued while the listing was in flight.
    pub fn refresh(
        &self,
        explicit: Option<&str>,
        bust_cache: bool,
    ) -> Result<Option<Arc<BranchListSnapshot>>, GitHubError> {
        let (generation, sequence) = {
            let mut state = self.lock();
            (state.generation, state.next_fetch())
        };

        let branches = self.reconciler.client().list_branches(&self.repo, bust_cache)?;

        let mut state = self.lock();
        if state.generation != generation {
            tracing::debug!(generation, "Discarding superseded branch list");
            return Ok(None);
        }
        let snapshot = Arc::new(BranchListSnapshot::new(self.repo.clone(), branches, sequence));
        state.install(snapshot, explicit);
        Ok(state.snapshot.clone())
    }

    /// Explicitly switch to `name`, superseding any in-flight
    /// reconciliation. Returns `false` (and changes nothing) if `name` is not
    /// in the current snapshot.
    pub fn select(&self, name: &str) -> bool {
        let mut state = self.lock();
        let listed = state.snapshot.as_ref().is_some_and(|s| s.contains(name));
        if listed {
            state.generation += 1;
            state.last_applied = state.generation;
            state.selected = Some(name.to_string());
        }
        listed
    }
}
