//! Terminal rendering for branch listings, file trees and reconciliation results.

pub mod cli;
pub mod colors;

pub use cli::{
    render_branches, render_delivery, render_file, render_file_tree, render_repos,
    render_tree_summary,
};
