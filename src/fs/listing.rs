use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use crate::error::{Result, TreeError};
use crate::fs::node::Node;

/// List and sort the children of `dir`, tagging them with `parent_depth + 1`.
///
/// Entries that vanish or cannot be read mid-listing are skipped. Failing to
/// open the directory itself is `ListingFailed`.
pub fn list_children(dir: &Path, parent_depth: usize) -> Result<Vec<Node>> {
    let entries = fs::read_dir(dir).map_err(|source| TreeError::ListingFailed {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut children: Vec<Node> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| Node::child(dir, parent_depth, &entry.path()))
        .collect();

    sort_nodes(&mut children);
    Ok(children)
}

/// Directories first, then files; each group by case-insensitive name.
pub fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(compare_nodes);
}

fn compare_nodes(a: &Node, b: &Node) -> Ordering {
    b.is_directory()
        .cmp(&a.is_directory())
        .then_with(|| compare_names(a.name(), b.name()))
}

/// Ordinal comparison of Unicode-lowercased names, raw name as tie-break.
pub(crate) fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
