//! Change notifications consumed by a rendering layer.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::fs::node::Node;

/// What happened to a range of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Removed,
}

/// One change to the flat list: `count` rows inserted at / removed from `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeUpdate {
    pub kind: ChangeKind,
    pub start: usize,
    pub count: usize,
}

impl TreeUpdate {
    pub fn inserted(start: usize, count: usize) -> Self {
        Self {
            kind: ChangeKind::Inserted,
            start,
            count,
        }
    }

    pub fn removed(start: usize, count: usize) -> Self {
        Self {
            kind: ChangeKind::Removed,
            start,
            count,
        }
    }
}

/// Receiver of tree change notifications.
///
/// Called once per completed expand or collapse, on the context that owns
/// the tree. `nodes` is the flat list as it stands after the change, so the
/// indices in `update` are valid against it.
pub trait UpdateSink: Send {
    fn on_change(&mut self, update: TreeUpdate, nodes: &[Node]);
}

impl<F> UpdateSink for F
where
    F: FnMut(TreeUpdate, &[Node]) + Send,
{
    fn on_change(&mut self, update: TreeUpdate, nodes: &[Node]) {
        self(update, nodes)
    }
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl UpdateSink for NullSink {
    fn on_change(&mut self, _update: TreeUpdate, _nodes: &[Node]) {}
}

/// Logs each notification at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl UpdateSink for LogSink {
    fn on_change(&mut self, update: TreeUpdate, nodes: &[Node]) {
        debug!(
            kind = ?update.kind,
            start = update.start,
            count = update.count,
            rows = nodes.len(),
            "tree changed"
        );
    }
}

/// Records notifications into a shared log that can be inspected from outside.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<TreeUpdate>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn updates(&self) -> Vec<TreeUpdate> {
        self.log.lock().clone()
    }

    /// Take and clear the recorded updates.
    pub fn drain(&self) -> Vec<TreeUpdate> {
        std::mem::take(&mut *self.log.lock())
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl UpdateSink for RecordingSink {
    fn on_change(&mut self, update: TreeUpdate, _nodes: &[Node]) {
        self.log.lock().push(update);
    }
}

/// Keeps its own copy of the visible rows by applying each update, the way a
/// list adapter mirrors the tree.
///
/// `rows()` equals the tree's paths as long as the indices delivered were valid.
#[derive(Debug, Default, Clone)]
pub struct MirrorSink {
    rows: Arc<Mutex<Vec<PathBuf>>>,
}

impl MirrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<PathBuf> {
        self.rows.lock().clone()
    }
}

impl UpdateSink for MirrorSink {
    fn on_change(&mut self, update: TreeUpdate, nodes: &[Node]) {
        let mut rows = self.rows.lock();
        let inserted: Vec<PathBuf> = match update.kind {
            ChangeKind::Inserted => nodes
                .get(update.start..update.start + update.count)
                .map(|slice| slice.iter().map(|n| n.path().to_path_buf()).collect())
                .unwrap_or_default(),
            ChangeKind::Removed => Vec::new(),
        };
        apply_update(&mut rows, update, inserted);
    }
}

/// Apply `update` to a mirrored row list. For insertions, `inserted` holds the new rows.
///
/// Out-of-range updates are clamped rather than panicking.
pub fn apply_update<T>(rows: &mut Vec<T>, update: TreeUpdate, inserted: Vec<T>) {
    let start = update.start.min(rows.len());
    match update.kind {
        ChangeKind::Inserted => {
            rows.splice(start..start, inserted);
        }
        ChangeKind::Removed => {
            let end = (start + update.count).min(rows.len());
            rows.drain(start..end);
        }
    }
}
