use std::path::PathBuf;

use crate::sink::TreeUpdate;

/// Updates that turn the `old` row list into `new`, comparing rows by path.
///
/// Applied in order (see [`crate::sink::apply_update`]) they transform `old`
/// into `new`. Shared prefix and suffix are kept; the differing middle
/// becomes one removal followed by one insertion.
pub fn diff_snapshots(old: &[PathBuf], new: &[PathBuf]) -> Vec<TreeUpdate> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old.len() - prefix - suffix;
    let inserted = new.len() - prefix - suffix;

    let mut updates = Vec::new();
    if removed > 0 {
        updates.push(TreeUpdate::removed(prefix, removed));
    }
    if inserted > 0 {
        updates.push(TreeUpdate::inserted(prefix, inserted));
    }
    updates
}
