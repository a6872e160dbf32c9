use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use crate::{
    config::ConfigFile,
    github::{GitHubClient, GitHubError, GitRefClient, RepoIdentifier, UpdateFileRequest},
    reconcile::{BranchReconciler, PollPolicy, ReconcilePhase, ReconciliationOutcome, SystemClock},
    selection::{Delivery, SelectionController},
    state::State,
};

mod config;
mod file_tree;
mod git;
mod github;
mod reconcile;
mod render;
mod selection;
mod state;
mod stats;
#[cfg(test)]
mod test_utils;

#[derive(Parser)]
#[command(author, version, about, arg_required_else_help = true)]
struct Args {
    #[arg(long, short, help = "Enable verbose output")]
    verbose: bool,

    /// Repository as `owner/repo` or a remote URL; defaults to the `origin` remote.
    #[arg(long, global = true)]
    repo: Option<String>,

    /// Print a summary of GitHub API calls on exit.
    #[arg(long, global = true)]
    stats: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List branches and show the selected one.
    Branches {
        /// Bypass intermediary caches.
        #[arg(long)]
        fresh: bool,
    },
    /// Create a branch if needed, wait until GitHub lists it, then select it.
    EnsureBranch {
        /// Defaults to `docs_branch` from the config file, else "docs".
        name: Option<String>,
        /// Branch to create from; defaults to the repository's default branch.
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Select an existing branch.
    Select { branch: String },
    /// Show the Markdown files on a branch as a tree.
    Tree {
        /// Defaults to the selected branch.
        #[arg(long)]
        branch: Option<String>,
        /// Include every file, not just Markdown.
        #[arg(long)]
        all: bool,
    },
    /// Print a file from a branch.
    Show {
        path: String,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Commit a local file's content to a path on a branch.
    Commit {
        path: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, short)]
        message: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// List repositories you can access.
    Repos {
        /// Only show repositories whose name contains this text.
        filter: Option<String>,
        /// GitHub host, for GitHub Enterprise.
        #[arg(long, default_value = "github.com")]
        host: String,
    },
    /// Store a GitHub token in the config file.
    Auth,
    /// Generate shell completions.
    Completion { shell: Shell },
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);
    let print_stats = args.stats;

    let result = inner_main(args);
    if print_stats {
        stats::print_summary();
    }
    if let Err(e) = result {
        tracing::error!(error = ?e);
        std::process::exit(1);
    }
    std::process::exit(0);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn with_auth_hint(error: GitHubError) -> anyhow::Error {
    match error {
        GitHubError::NotAuthenticated => {
            anyhow!("No GitHub token found. Set GITHUB_TOKEN or run `docs-branch auth`.")
        }
        other => other.into(),
    }
}

type Controller = SelectionController<GitHubClient, SystemClock>;

struct Session {
    repo: RepoIdentifier,
    config: ConfigFile,
    state: State,
}

impl Session {
    fn open(repo_arg: Option<&str>) -> Result<Self> {
        let repo = github::resolve_repo(repo_arg)?;
        let config = config::load_config().context("loading config")?;
        let state = state::load_state().context("loading state")?;
        tracing::debug!(repo = %repo, "Using repository");
        Ok(Self {
            repo,
            config,
            state,
        })
    }

    fn client(&self) -> Result<GitHubClient> {
        GitHubClient::from_env(&self.repo).map_err(with_auth_hint)
    }

    fn controller(&self, policy: PollPolicy) -> Result<Controller> {
        let reconciler = BranchReconciler::new(self.client()?, SystemClock, policy);
        let previous = self.state.selected_branch(&self.repo).map(str::to_string);
        Ok(SelectionController::new(reconciler, self.repo.clone()).with_selection(previous))
    }

    /// Persist the controller's selection.
    fn save_selection(&mut self, controller: &Controller) -> Result<()> {
        self.state
            .set_selected_branch(&self.repo, controller.selected().as_deref());
        state::save_state(&self.state).context("saving state")
    }

    /// `--branch` if given, else the selected branch, else the default branch.
    fn target_branch(&self, client: &GitHubClient, branch: Option<String>) -> Result<String> {
        if let Some(branch) = branch {
            return Ok(branch);
        }
        if let Some(selected) = self.state.selected_branch(&self.repo) {
            return Ok(selected.to_string());
        }
        Ok(client.default_branch(&self.repo)?)
    }
}

fn inner_main(args: Args) -> Result<()> {
    match args.command {
        Commands::Completion { shell } => {
            clap_complete::generate(
                shell,
                &mut Args::command(),
                env!("CARGO_PKG_NAME"),
                &mut io::stdout(),
            );
            Ok(())
        }
        Commands::Repos { filter, host } => {
            let client = GitHubClient::for_host(&host).map_err(with_auth_hint)?;
            let mut repos = client.list_user_repos()?;
            if let Some(filter) = filter.as_deref() {
                repos.retain(|repo| repo.matches(filter));
            }
            render::render_repos(&repos);
            Ok(())
        }
        Commands::Auth => {
            github::setup_github_token_interactive()?;
            Ok(())
        }
        Commands::Branches { fresh } => {
            let mut session = Session::open(args.repo.as_deref())?;
            list_branches(&mut session, fresh)
        }
        Commands::EnsureBranch {
            name,
            source,
            interval_ms,
            timeout_ms,
        } => {
            let mut session = Session::open(args.repo.as_deref())?;
            let name = name.unwrap_or_else(|| session.config.docs_branch().to_string());
            let mut policy = session.config.poll.to_policy();
            if let Some(interval_ms) = interval_ms {
                policy.interval = Duration::from_millis(interval_ms);
            }
            if let Some(timeout_ms) = timeout_ms {
                policy.timeout = Duration::from_millis(timeout_ms);
            }
            ensure_branch(&mut session, &name, source.as_deref(), policy)
        }
        Commands::Select { branch } => {
            let mut session = Session::open(args.repo.as_deref())?;
            select_branch(&mut session, &branch)
        }
        Commands::Tree { branch, all } => {
            let session = Session::open(args.repo.as_deref())?;
            show_tree(&session, branch, all)
        }
        Commands::Show { path, branch } => {
            let session = Session::open(args.repo.as_deref())?;
            let client = session.client()?;
            let branch = session.target_branch(&client, branch)?;
            let file = client
                .file_content(&session.repo, &path, &branch)
                .with_context(|| format!("reading {} on '{}'", path, branch))?;
            render::render_file(&file);
            Ok(())
        }
        Commands::Commit {
            path,
            file,
            message,
            branch,
        } => {
            let session = Session::open(args.repo.as_deref())?;
            commit_file(&session, &path, &file, message.as_deref(), branch)
        }
    }
}

fn list_branches(session: &mut Session, fresh: bool) -> Result<()> {
    let controller = session.controller(session.config.poll.to_policy())?;
    let snapshot = controller
        .refresh(None, fresh)?
        .ok_or_else(|| anyhow!("Branch list was superseded"))?;
    render::render_branches(&snapshot, controller.selected().as_deref());
    session.save_selection(&controller)
}

fn select_branch(session: &mut Session, branch: &str) -> Result<()> {
    let controller = session.controller(session.config.poll.to_policy())?;
    controller.refresh(None, true)?;
    if !controller.select(branch) {
        let available = controller
            .snapshot()
            .map(|snapshot| {
                snapshot
                    .branches()
                    .iter()
                    .map(|b| b.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        bail!(
            "Branch '{}' does not exist in {} (available: {}). Use `docs-branch ensure-branch {}` to create it.",
            branch,
            session.repo.full_name(),
            available,
            branch
        );
    }
    session.save_selection(&controller)?;
    println!("Selected branch {}", branch);
    Ok(())
}

fn ensure_branch(
    session: &mut Session,
    name: &str,
    source: Option<&str>,
    policy: PollPolicy,
) -> Result<()> {
    let controller = session.controller(policy)?;
    tracing::debug!(policy = ?controller.reconciler().policy(), "Ensuring branch '{}'", name);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("{}: {}", name, ReconcilePhase::Idle));

    let delivery = controller.request_reconciliation(name, source, &mut |phase: &ReconcilePhase| {
        spinner.set_message(format!("{}: {}", name, phase));
    });
    spinner.finish_and_clear();
    let delivery = delivery?;

    render::render_delivery(&delivery);
    if matches!(delivery, Delivery::Applied { .. }) {
        session.save_selection(&controller)?;
    }
    if let ReconciliationOutcome::Failed { error, .. } = delivery.outcome() {
        bail!("Could not create branch '{}': {}", name, error);
    }
    Ok(())
}

fn show_tree(session: &Session, branch: Option<String>, all: bool) -> Result<()> {
    let client = session.client()?;
    let branch = session.target_branch(&client, branch)?;
    let entries = client
        .tree(&session.repo, &branch)
        .with_context(|| format!("listing files on '{}'", branch))?;
    let paths = if all {
        file_tree::blob_paths(&entries)
    } else {
        file_tree::markdown_paths(&entries)
    };
    tracing::debug!("{} of {} entries on '{}'", paths.len(), entries.len(), branch);
    let bytes = file_tree::total_size(&entries, &paths);
    let files = paths.len();
    let nodes = file_tree::sorted(&file_tree::build(paths));
    render::render_file_tree(&nodes);
    render::render_tree_summary(files, bytes);
    Ok(())
}

fn commit_file(
    session: &Session,
    path: &str,
    local: &Path,
    message: Option<&str>,
    branch: Option<String>,
) -> Result<()> {
    let content =
        fs::read_to_string(local).with_context(|| format!("reading {}", local.display()))?;
    let client = session.client()?;
    let branch = session.target_branch(&client, branch)?;

    let existing_sha = match client.file_content(&session.repo, path, &branch) {
        Ok(existing) => {
            if existing.content == content {
                println!("{} is unchanged on '{}'", path, branch);
                return Ok(());
            }
            Some(existing.sha)
        }
        Err(GitHubError::Remote { status: 404, .. }) => None,
        Err(error) => {
            return Err(error).with_context(|| format!("reading {} on '{}'", path, branch));
        }
    };

    let commit = client.update_file(
        &session.repo,
        UpdateFileRequest {
            path,
            content: &content,
            sha: existing_sha.as_deref(),
            branch: &branch,
            message,
        },
    )?;
    println!(
        "Committed {} to '{}' ({})",
        path,
        branch,
        commit.get(..8).unwrap_or(&commit)
    );
    Ok(())
}
