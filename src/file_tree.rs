//! Hierarchical file tree built from a flat list of repository paths.

use std::collections::{HashMap, HashSet};

use crate::github::{EntryKind, TreeEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Blob,
    Tree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTreeNode {
    /// Full path from the repository root.
    pub path: String,
    pub kind: NodeKind,
    /// Always empty for blobs.
    pub children: Vec<FileTreeNode>,
}

impl FileTreeNode {
    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_tree(&self) -> bool {
        self.kind == NodeKind::Tree
    }
}

struct Slot {
    path: String,
    kind: NodeKind,
    children: Vec<usize>,
}

/// Build a tree from full paths, in any order.
///
/// Directories are materialized from path prefixes, so `a/b/c.md` yields
/// `a` and `a/b` even if neither is listed. Each node appears once, and
/// children keep first-encounter order; use [`sorted`] for display order.
/// Empty segments (`a//b`, leading or trailing `/`) are ignored. A path first
/// seen as a file and later used as a directory becomes a directory.
pub fn build<I, S>(paths: I) -> Vec<FileTreeNode>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut slots: Vec<Slot> = Vec::new();
    let mut by_path: HashMap<String, usize> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();

    for path in paths {
        let segments: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let mut parent: Option<usize> = None;
        let mut prefix = String::new();

        for (depth, segment) in segments.iter().enumerate() {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            let is_leaf = depth + 1 == segments.len();

            let id = match by_path.get(&prefix) {
                Some(&id) => {
                    if !is_leaf {
                        slots[id].kind = NodeKind::Tree;
                    }
                    id
                }
                None => {
                    let id = slots.len();
                    slots.push(Slot {
                        path: prefix.clone(),
                        kind: if is_leaf { NodeKind::Blob } else { NodeKind::Tree },
                        children: Vec::new(),
                    });
                    by_path.insert(prefix.clone(), id);
                    match parent {
                        Some(parent) => slots[parent].children.push(id),
                        None => roots.push(id),
                    }
                    id
                }
            };
            parent = Some(id);
        }
    }

    roots.iter().map(|&id| materialize(&slots, id)).collect()
}

fn materialize(slots: &[Slot], id: usize) -> FileTreeNode {
    let slot = &slots[id];
    FileTreeNode {
        path: slot.path.clone(),
        kind: slot.kind,
        children: slot
            .children
            .iter()
            .map(|&child| materialize(slots, child))
            .collect(),
    }
}

/// Paths of the Markdown blobs in a tree listing.
pub fn markdown_paths(entries: &[TreeEntry]) -> Vec<&str> {
    entries
        .iter()
        .filter(|entry| entry.kind == EntryKind::Blob)
        .map(|entry| entry.path.as_str())
        .filter(|path| path.to_ascii_lowercase().ends_with(".md"))
        .collect()
}

/// Paths of all blobs in a tree listing.
pub fn blob_paths(entries: &[TreeEntry]) -> Vec<&str> {
    entries
        .iter()
        .filter(|entry| entry.kind == EntryKind::Blob)
        .map(|entry| entry.path.as_str())
        .collect()
}

/// Combined size in bytes of the blobs at `paths`.
pub fn total_size(entries: &[TreeEntry], paths: &[&str]) -> u64 {
    let wanted: HashSet<&str> = paths.iter().copied().collect();
    entries
        .iter()
        .filter(|entry| entry.kind == EntryKind::Blob && wanted.contains(entry.path.as_str()))
        .filter_map(|entry| entry.size)
        .sum()
}

/// Copy of `nodes` with directories first, then by name, at every level.
pub fn sorted(nodes: &[FileTreeNode]) -> Vec<FileTreeNode> {
    let mut nodes: Vec<FileTreeNode> = nodes
        .iter()
        .map(|node| FileTreeNode {
            children: sorted(&node.children),
            ..node.clone()
        })
        .collect();
    nodes.sort_by(|a, b| {
        b.is_tree()
            .cmp(&a.is_tree())
            .then_with(|| a.name().cmp(b.name()))
    });
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(path: &str) -> FileTreeNode {
        FileTreeNode {
            path: path.to_string(),
            kind: NodeKind::Blob,
            children: vec![],
        }
    }

    fn tree(path: &str, children: Vec<FileTreeNode>) -> FileTreeNode {
        FileTreeNode {
            path: path.to_string(),
            kind: NodeKind::Tree,
            children,
        }
    }

    fn entry(path: &str, kind: EntryKind) -> TreeEntry {
        TreeEntry {
            path: path.to_string(),
            kind,
            size: (kind == EntryKind::Blob).then_some(path.len() as u64),
        }
    }

    #[test]
    fn nested_paths_share_directory_nodes() {
        let nodes = build(["a/b.md", "a/c/d.md"]);
        assert_eq!(
            nodes,
            vec![tree("a", vec![blob("a/b.md"), tree("a/c", vec![blob("a/c/d.md")])])]
        );
    }

    #[test]
    fn build_is_deterministic() {
        let paths = ["docs/z.md", "README.md", "docs/guide/a.md", "docs/a.md"];
        assert_eq!(build(paths), build(paths));
    }

    #[test]
    fn children_keep_first_encounter_order() {
        let nodes = build(["docs/z.md", "README.md", "docs/a.md"]);
        assert_eq!(
            nodes,
            vec![
                tree("docs", vec![blob("docs/z.md"), blob("docs/a.md")]),
                blob("README.md"),
            ]
        );
    }

    #[test]
    fn unlisted_directories_are_materialized_once() {
        let nodes = build(["x/y/one.md", "x/y/two.md", "x/three.md"]);
        assert_eq!(nodes.len(), 1);
        let x = &nodes[0];
        assert_eq!(x.path, "x");
        assert!(x.is_tree());
        assert_eq!(x.children.len(), 2);
        assert_eq!(x.children[0].path, "x/y");
        assert_eq!(x.children[0].children.len(), 2);
        assert_eq!(x.children[0].children[1].name(), "two.md");
    }

    #[test]
    fn file_later_used_as_directory_becomes_tree() {
        let nodes = build(["notes", "notes/today.md"]);
        assert_eq!(nodes, vec![tree("notes", vec![blob("notes/today.md")])]);
    }

    #[test]
    fn empty_segments_are_ignored() {
        let nodes = build(["/a//b.md", "", "a/b.md/"]);
        assert_eq!(nodes, vec![tree("a", vec![blob("a/b.md")])]);
    }

    #[test]
    fn markdown_filter_keeps_md_blobs_only() {
        let entries = vec![
            entry("docs", EntryKind::Tree),
            entry("docs/intro.md", EntryKind::Blob),
            entry("docs/logo.png", EntryKind::Blob),
            entry("CHANGELOG.MD", EntryKind::Blob),
            entry("vendor/lib.md", EntryKind::Commit),
        ];
        assert_eq!(markdown_paths(&entries), vec!["docs/intro.md", "CHANGELOG.MD"]);
        assert_eq!(
            blob_paths(&entries),
            vec!["docs/intro.md", "docs/logo.png", "CHANGELOG.MD"]
        );
    }

    #[test]
    fn sorted_puts_directories_first() {
        let nodes = sorted(&build(["b.md", "a.md", "guide/z.md", "guide/y.md"]));
        let names: Vec<&str> = nodes.iter().map(FileTreeNode::name).collect();
        assert_eq!(names, vec!["guide", "a.md", "b.md"]);
        assert_eq!(nodes[0].children[0].name(), "y.md");
    }

    #[test]
    fn total_size_counts_selected_blobs() {
        let entries = vec![
            entry("docs", EntryKind::Tree),
            entry("docs/intro.md", EntryKind::Blob),
            entry("docs/logo.png", EntryKind::Blob),
        ];
        let paths = markdown_paths(&entries);
        assert_eq!(total_size(&entries, &paths), "docs/intro.md".len() as u64);
        assert_eq!(total_size(&entries, &["docs"]), 0);
    }
}
