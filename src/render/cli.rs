//! CLI text rendering.

use colored::Colorize;

use super::colors::{name_color, theme};
use crate::{
    file_tree::FileTreeNode,
    github::{FileContent, UserRepo},
    reconcile::ReconciliationOutcome,
    selection::{BranchListSnapshot, Delivery},
};

/// Dimming factor for branches that are not selected.
const DIM_FACTOR: f32 = 0.75;

fn selection_marker() -> &'static str {
    if cfg!(target_os = "windows") {
        ">"
    } else {
        "→"
    }
}

/// Render a branch listing, marking the selected branch.
pub fn render_branches(snapshot: &BranchListSnapshot, selected: Option<&str>) {
    if snapshot.branches().is_empty() {
        println!("{}", theme::LABEL.paint("(no branches)"));
    }
    for branch in snapshot.branches() {
        if selected == Some(branch.name.as_str()) {
            print!("{} ", selection_marker().bright_purple().bold());
            println!("{}", name_color(&branch.name).paint(&branch.name).bold());
        } else {
            print!("  ");
            println!("{}", name_color(&branch.name).dim(DIM_FACTOR).paint(&branch.name));
        }
    }
    let footer = format!(
        "{} branches in {}, fetched {}",
        snapshot.branches().len(),
        snapshot.repo().full_name(),
        snapshot.fetched_at().format("%H:%M:%S")
    );
    println!("{}", theme::MUTED.paint(&footer));
}

/// Render repositories as `owner/name`, with a private marker and the
/// description when there is one.
pub fn render_repos(repos: &[UserRepo]) {
    if repos.is_empty() {
        println!("{}", theme::LABEL.paint("(no repositories)"));
        return;
    }
    for repo in repos {
        let mut line = name_color(&repo.full_name).paint(&repo.full_name).to_string();
        if repo.private {
            line.push_str(&format!(" {}", theme::PRIVATE.paint("[private]")));
        }
        if let Some(description) = repo.description.as_deref().filter(|d| !d.is_empty()) {
            line.push_str(&format!(" {}", theme::MUTED.paint(description)));
        }
        println!("{}", line);
    }
}

/// Depth-first walk of a file tree, paired with each node's depth.
pub fn flatten(nodes: &[FileTreeNode]) -> Vec<(usize, &FileTreeNode)> {
    fn walk<'a>(
        nodes: &'a [FileTreeNode],
        depth: usize,
        out: &mut Vec<(usize, &'a FileTreeNode)>,
    ) {
        for node in nodes {
            out.push((depth, node));
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(nodes, 0, &mut out);
    out
}

pub fn render_file_tree(nodes: &[FileTreeNode]) {
    if nodes.is_empty() {
        println!("{}", theme::LABEL.paint("(no files)"));
        return;
    }
    for (depth, node) in flatten(nodes) {
        for _ in 0..depth {
            print!("{}", theme::TREE_GUIDE.paint("┃ "));
        }
        if node.is_tree() {
            println!("{}", theme::DIRECTORY.paint(&format!("{}/", node.name())).bold());
        } else {
            println!("{}", node.name());
        }
    }
}

fn human_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

/// File count and combined size under a rendered tree.
pub fn render_tree_summary(files: usize, bytes: u64) {
    let summary = format!("{} files, {}", files, human_size(bytes));
    println!("{}", theme::MUTED.paint(&summary));
}

pub fn render_file(file: &FileContent) {
    let short_sha = file.sha.get(..8).unwrap_or(&file.sha);
    println!(
        "{} {}",
        theme::PENDING.paint(&file.path).bold(),
        theme::SHA.paint(short_sha)
    );
    println!("{}", theme::MUTED.paint(&"-".repeat(64)));
    print!("{}", file.content);
    if !file.content.ends_with('\n') {
        println!();
    }
}

fn outcome_line(outcome: &ReconciliationOutcome) -> colored::ColoredString {
    let text = outcome.to_string();
    match outcome {
        ReconciliationOutcome::Created { .. } | ReconciliationOutcome::AlreadyExisted { .. } => {
            theme::OK.paint(&text)
        }
        ReconciliationOutcome::TimedOut { .. } => theme::PENDING.paint(&text),
        ReconciliationOutcome::Failed { .. } => theme::ERROR.paint(&text),
    }
}

/// Render what a delivered reconciliation did to the selection.
pub fn render_delivery(delivery: &Delivery) {
    match delivery {
        Delivery::Applied { outcome, selected } => {
            println!("{}", outcome_line(outcome));
            if let Some(selected) = selected {
                println!(
                    "{} {}",
                    theme::LABEL.paint("Selected branch"),
                    name_color(selected).paint(selected).bold()
                );
            }
        }
        Delivery::Superseded { outcome } => {
            let text = format!(
                "Ignoring result for '{}': a newer request replaced it",
                outcome.branch_name()
            );
            println!("{}", theme::MUTED.paint(&text));
        }
        Delivery::Duplicate { outcome } => {
            let text = format!("Result for '{}' was already applied", outcome.branch_name());
            println!("{}", theme::MUTED.paint(&text));
        }
    }
}
