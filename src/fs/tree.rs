use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, instrument, warn};

use crate::error::{Result, TreeError};
use crate::fs::cache::DirectoryCache;
use crate::fs::listing::list_children;
use crate::fs::node::Node;
use crate::sink::{TreeUpdate, UpdateSink};

/// Engine behaviour that is not cache tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeOptions {
    /// Start priming the cache from the root during bootstrap.
    pub prime_on_bootstrap: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            prime_on_bootstrap: true,
        }
    }
}

/// Children resolved off the owner's context, waiting to be spliced in.
#[derive(Debug)]
struct Completion {
    path: PathBuf,
    request: u64,
    children: Vec<Node>,
}

/// An expand that has been started but not yet spliced.
#[derive(Debug)]
struct PendingExpand {
    request: u64,
    cancel: CancellationToken,
}

/// How the root passed validation.
#[derive(Debug, PartialEq, Eq)]
enum RootAccess {
    ReadWrite,
    ReadOnly,
    Unreadable(String),
}

/// Owner of the flat node list and the expanded set.
///
/// All mutation goes through `&mut self`: the owner is the single writer.
/// Background listings only produce completions, which are applied by
/// [`process_pending`](Self::process_pending), [`next_update`](Self::next_update)
/// or [`settle`](Self::settle), each re-validating the node's current
/// presence and index before splicing.
pub struct TreeState {
    nodes: Vec<Node>,
    expanded: HashSet<PathBuf>,
    pending: HashMap<PathBuf, PendingExpand>,
    next_request: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    cache: Arc<DirectoryCache>,
    sink: Box<dyn UpdateSink>,
    options: TreeOptions,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TreeState {
    /// Create an empty tree. Call [`bootstrap`](Self::bootstrap) to load a root.
    ///
    /// Background listings run on the cache's runtime, so the tree itself may
    /// live on a thread without one (see [`DirectoryCache::with_runtime`]).
    /// With no runtime at all, each listing gets its own thread and priming
    /// is skipped.
    pub fn new(
        cache: Arc<DirectoryCache>,
        sink: impl UpdateSink + 'static,
        options: TreeOptions,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            nodes: Vec::new(),
            expanded: HashSet::new(),
            pending: HashMap::new(),
            next_request: 0,
            completions_tx,
            completions_rx,
            cache,
            sink: Box::new(sink),
            options,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Validate `root`, seed the list with it and start expanding it.
    ///
    /// A missing root leaves the tree empty. An unreadable root is still
    /// inserted and expanded (it will show no children). Both return
    /// `InvalidRoot`, which callers may log and otherwise ignore.
    #[instrument(level = "debug", skip_all, fields(root = %root.display()))]
    pub fn bootstrap(&mut self, root: &Path) -> Result<()> {
        self.reset();

        let root = match root.canonicalize() {
            Ok(path) => path,
            Err(e) => {
                error!(path = %root.display(), error = %e, "root path is invalid or does not exist");
                return Err(TreeError::invalid_root(root, e.to_string()));
            }
        };

        let outcome = match check_root_access(&root) {
            RootAccess::ReadWrite => Ok(()),
            RootAccess::ReadOnly => {
                warn!(path = %root.display(), "root is not writable, continuing");
                Ok(())
            }
            RootAccess::Unreadable(reason) => {
                error!(path = %root.display(), %reason, "root is not readable");
                debug!("continuing anyway");
                Err(TreeError::invalid_root(&root, reason))
            }
        };

        self.nodes.push(Node::root(&root));
        self.reindex();
        self.sink.on_change(TreeUpdate::inserted(0, 1), &self.nodes);

        if self.options.prime_on_bootstrap {
            // Handle is not needed: the cache tracks the pass and shutdown stops it.
            let _ = self.cache.prime_subtree(&self.nodes[..1]);
            self.cache.spawn_periodic_trim();
        }

        self.expand(&root);
        outcome
    }

    /// Drop every row and outstanding expand, notifying the sink if rows existed.
    fn reset(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.cancel.cancel();
        }
        self.expanded.clear();
        if !self.nodes.is_empty() {
            let count = self.nodes.len();
            self.nodes.clear();
            self.sink.on_change(TreeUpdate::removed(0, count), &self.nodes);
        }
    }

    /// Reveal the children of the directory at `path`.
    ///
    /// Marks the node expanded and loading before returning; the splice
    /// happens when the completion is applied. No-op for files, already
    /// expanded nodes, paths not in the list, and after shutdown. A node
    /// that stopped being a directory on disk is logged and left collapsed.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn expand(&mut self, path: &Path) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(index) = self.index_of(path) else {
            debug!("expand ignored, node not present");
            return;
        };

        let node = &mut self.nodes[index];
        if node.expanded {
            return;
        }
        let was_directory = node.is_directory();
        if !node.refresh_kind() {
            if was_directory {
                warn!("directory vanished or changed type, not expanding");
            }
            return;
        }
        node.expanded = true;
        node.loading = true;
        node.child_range = None;
        let depth = node.depth;
        let path = node.path.clone();

        self.expanded.insert(path.clone());
        let request = self.next_request;
        self.next_request += 1;
        let cancel = self.cancel.child_token();
        self.pending.insert(
            path.clone(),
            PendingExpand {
                request,
                cancel: cancel.clone(),
            },
        );

        if let Some(cached) = self.cache.lookup(&path) {
            debug!(children = cached.len(), "expand served from cache");
            let _ = self.completions_tx.send(Completion {
                path,
                request,
                children: cached.to_vec(),
            });
            return;
        }

        let tx = self.completions_tx.clone();
        let cache = Arc::clone(&self.cache);
        let Some(runtime) = self.cache.runtime().cloned() else {
            spawn_listing_thread(cache, tx, cancel, path, request, depth);
            return;
        };
        self.tracker.spawn_on(
            async move {
                let listing = tokio::task::spawn_blocking({
                    let dir = path.clone();
                    move || list_and_store(&cache, dir, depth)
                });

                tokio::select! {
                    _ = cancel.cancelled() => {}
                    joined = listing => {
                        let children = joined.unwrap_or_else(|e| {
                            warn!(path = %path.display(), error = %e, "listing task failed");
                            Vec::new()
                        });
                        let _ = tx.send(Completion { path, request, children });
                    }
                }
            },
            &runtime,
        );
    }

    /// Hide every descendant of the node at `path`.
    ///
    /// Cancels in-flight expands of the node and its descendants; their
    /// results are discarded when they arrive.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub fn collapse(&mut self, path: &Path) {
        let Some(index) = self.index_of(path) else {
            return;
        };
        if !self.nodes[index].expanded {
            return;
        }

        let end = self.subtree_end(index);
        let removed: Vec<Node> = self.nodes.drain(index + 1..end).collect();
        for node in &removed {
            self.expanded.remove(&node.path);
            self.cancel_pending(&node.path);
        }

        let node = &mut self.nodes[index];
        node.expanded = false;
        node.loading = false;
        node.child_range = None;
        let path = node.path.clone();
        self.expanded.remove(&path);
        self.cancel_pending(&path);

        self.reindex();
        debug!(removed = removed.len(), "collapsed");
        self.sink
            .on_change(TreeUpdate::removed(index + 1, removed.len()), &self.nodes);
    }

    /// Collapse an expanded node, expand anything else.
    pub fn toggle(&mut self, path: &Path) {
        match self.node(path) {
            Some(node) if node.expanded => self.collapse(path),
            Some(_) => self.expand(path),
            None => {}
        }
    }

    fn cancel_pending(&mut self, path: &Path) {
        if let Some(pending) = self.pending.remove(path) {
            pending.cancel.cancel();
        }
    }

    /// Apply every completion that has already arrived, without waiting.
    ///
    /// Returns how many were spliced; discarded ones are not counted.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            if self.apply_completion(completion) {
                applied += 1;
            }
        }
        applied
    }

    /// Wait for the next completion and apply it.
    ///
    /// Returns `false` without waiting when no expand is outstanding.
    pub async fn next_update(&mut self) -> bool {
        if self.pending.is_empty() || self.cancel.is_cancelled() {
            return false;
        }
        match self.completions_rx.recv().await {
            Some(completion) => {
                self.apply_completion(completion);
                true
            }
            None => false,
        }
    }

    /// Apply completions until no expand is outstanding.
    pub async fn settle(&mut self) {
        while self.next_update().await {}
        self.process_pending();
    }

    fn apply_completion(&mut self, completion: Completion) -> bool {
        let Completion {
            path,
            request,
            children,
        } = completion;

        match self.pending.get(&path) {
            Some(pending) if pending.request == request => {
                self.pending.remove(&path);
            }
            _ => {
                debug!(path = %path.display(), "discarding superseded expand result");
                return false;
            }
        }

        let Some(index) = self.index_of(&path) else {
            debug!(path = %path.display(), "discarding expand result, node no longer present");
            return false;
        };
        let node = &mut self.nodes[index];
        if !node.expanded {
            return false;
        }
        node.loading = false;
        let depth = node.depth;

        let insert_at = index + 1;
        let count = children.len();
        self.nodes.splice(
            insert_at..insert_at,
            children.iter().map(|child| child.fresh_at(&path, depth + 1)),
        );
        self.reindex();
        self.sink
            .on_change(TreeUpdate::inserted(insert_at, count), &self.nodes);
        true
    }

    /// First index after the descendant block of the node at `index`.
    fn subtree_end(&self, index: usize) -> usize {
        let depth = self.nodes[index].depth;
        self.nodes[index + 1..]
            .iter()
            .position(|n| n.depth <= depth)
            .map_or(self.nodes.len(), |offset| index + 1 + offset)
    }

    /// Recompute every node's descendant range after a splice or removal.
    fn reindex(&mut self) {
        let mut open: Vec<usize> = Vec::new();
        for i in 0..self.nodes.len() {
            let depth = self.nodes[i].depth;
            while let Some(&top) = open.last() {
                if self.nodes[top].depth < depth {
                    break;
                }
                open.pop();
                self.close_range(top, i);
            }
            open.push(i);
        }
        let len = self.nodes.len();
        for top in open {
            self.close_range(top, len);
        }
    }

    fn close_range(&mut self, index: usize, end: usize) {
        let node = &mut self.nodes[index];
        node.child_range = if node.expanded && !node.loading {
            Some(index + 1..end)
        } else {
            None
        };
    }

    /// The flat list: a pre-order traversal of the expanded subtree.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn node(&self, path: &Path) -> Option<&Node> {
        self.index_of(path).map(|i| &self.nodes[i])
    }

    /// Current index of the node with `path`.
    pub fn index_of(&self, path: &Path) -> Option<usize> {
        self.nodes.iter().position(|n| n.path == path)
    }

    /// Paths of every expanded node in the list.
    pub fn expanded_paths(&self) -> &HashSet<PathBuf> {
        &self.expanded
    }

    /// Expanded nodes in list order.
    pub fn expanded_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| self.expanded.contains(&n.path))
            .collect()
    }

    /// Whether any expand is still waiting for its children.
    pub fn is_loading(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn cache(&self) -> &Arc<DirectoryCache> {
        &self.cache
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Check the structural invariants of the flat list.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut ancestors: Vec<usize> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if i == 0 {
                if node.depth != 0 {
                    return Err(format!("root {} has depth {}", node.path.display(), node.depth));
                }
            } else if node.depth == 0 {
                return Err(format!("second root at index {i}"));
            }

            while let Some(&top) = ancestors.last() {
                if self.nodes[top].depth < node.depth {
                    break;
                }
                ancestors.pop();
            }
            if let Some(&parent_index) = ancestors.last() {
                let parent = &self.nodes[parent_index];
                if parent.depth + 1 != node.depth {
                    return Err(format!("{} skips a level under {}", node.path.display(), parent.path.display()));
                }
                if !parent.expanded || parent.loading {
                    return Err(format!("{} listed under unexpanded {}", node.path.display(), parent.path.display()));
                }
                if node.parent.as_deref() != Some(parent.path.as_path()) {
                    return Err(format!("{} follows non-parent {}", node.path.display(), parent.path.display()));
                }
            }
            ancestors.push(i);

            let expected = if node.expanded && !node.loading {
                Some(i + 1..self.subtree_end(i))
            } else {
                None
            };
            if node.child_range != expected {
                return Err(format!(
                    "{} has range {:?}, expected {:?}",
                    node.path.display(),
                    node.child_range,
                    expected
                ));
            }
            if node.expanded != self.expanded.contains(&node.path) {
                return Err(format!("expanded set disagrees about {}", node.path.display()));
            }
        }

        let listed = self.nodes.iter().filter(|n| n.expanded).count();
        if listed != self.expanded.len() {
            return Err(format!(
                "expanded set has {} entries, list has {listed} expanded nodes",
                self.expanded.len()
            ));
        }
        Ok(())
    }

    /// Cancel in-flight expands and cache priming. Never waits; safe to repeat.
    pub fn shutdown(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!(pending = self.pending.len(), "tree shutting down");
        }
        self.cancel.cancel();
        self.tracker.close();

        // Expands that never completed fall back to collapsed.
        let abandoned: Vec<PathBuf> = self.pending.keys().cloned().collect();
        for path in abandoned {
            self.cancel_pending(&path);
            self.expanded.remove(&path);
            if let Some(index) = self.index_of(&path) {
                let node = &mut self.nodes[index];
                node.expanded = false;
                node.loading = false;
            }
        }
        self.reindex();
        self.cache.shutdown();
    }

    /// [`shutdown`](Self::shutdown), then wait up to `timeout` for background
    /// tasks to exit. Returns whether they all did.
    pub async fn shutdown_and_wait(&mut self, timeout: Duration) -> bool {
        self.shutdown();
        let tree_done = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        tree_done && self.cache.wait_idle(timeout).await
    }
}

impl Drop for TreeState {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.cache.shutdown();
    }
}

/// List `dir` and memoize the result. Failures show as an empty directory.
fn list_and_store(cache: &DirectoryCache, dir: PathBuf, depth: usize) -> Vec<Node> {
    match list_children(&dir, depth) {
        Ok(children) => {
            cache.insert(dir, children.clone());
            children
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "directory listing failed, showing it empty");
            Vec::new()
        }
    }
}

/// Run one listing on a plain thread when no async runtime is available.
fn spawn_listing_thread(
    cache: Arc<DirectoryCache>,
    tx: mpsc::UnboundedSender<Completion>,
    cancel: CancellationToken,
    path: PathBuf,
    request: u64,
    depth: usize,
) {
    let job = {
        let path = path.clone();
        let tx = tx.clone();
        move || {
            let children = list_and_store(&cache, path.clone(), depth);
            if !cancel.is_cancelled() {
                let _ = tx.send(Completion {
                    path,
                    request,
                    children,
                });
            }
        }
    };
    if let Err(e) = std::thread::Builder::new()
        .name("lazytree-list".into())
        .spawn(job)
    {
        warn!(path = %path.display(), error = %e, "could not start listing thread");
        let _ = tx.send(Completion {
            path,
            request,
            children: Vec::new(),
        });
    }
}

/// Readability decides validity; writability only warns.
fn check_root_access(path: &Path) -> RootAccess {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return RootAccess::Unreadable(e.to_string()),
    };
    let readable = if meta.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else {
        fs::File::open(path).map(|_| ())
    };
    if let Err(e) = readable {
        return RootAccess::Unreadable(e.to_string());
    }
    let writable = if meta.is_dir() {
        tempfile::tempfile_in(path).is_ok()
    } else {
        fs::OpenOptions::new().append(true).open(path).is_ok()
    };
    if writable {
        RootAccess::ReadWrite
    } else {
        RootAccess::ReadOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::cache::CacheOptions;
    use crate::sink::{ChangeKind, MirrorSink, NullSink, RecordingSink};
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn setup_test_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::create_dir(dir.path().join("beta")).unwrap();
        File::create(dir.path().join("file_a.txt")).unwrap();
        File::create(dir.path().join("file_b.rs")).unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        fs::create_dir(dir.path().join("alpha").join("nested")).unwrap();
        File::create(dir.path().join("alpha").join("inner.txt")).unwrap();
        dir
    }

    fn quiet_cache() -> Arc<DirectoryCache> {
        Arc::new(DirectoryCache::new(CacheOptions {
            max_entries: 64,
            workers: 2,
            trim_interval: None,
        }))
    }

    fn no_prime() -> TreeOptions {
        TreeOptions {
            prime_on_bootstrap: false,
        }
    }

    async fn loaded(dir: &TempDir) -> (TreeState, RecordingSink) {
        let sink = RecordingSink::new();
        let mut tree = TreeState::new(quiet_cache(), sink.clone(), no_prime());
        tree.bootstrap(dir.path()).unwrap();
        tree.settle().await;
        (tree, sink)
    }

    fn names(tree: &TreeState) -> Vec<&str> {
        tree.nodes().iter().map(|n| n.name()).collect()
    }

    fn root_path(dir: &TempDir) -> PathBuf {
        dir.path().canonicalize().unwrap()
    }

    #[tokio::test]
    async fn bootstrap_expands_root_sorted() {
        let dir = setup_test_dir();
        let (tree, sink) = loaded(&dir).await;

        assert_eq!(
            &names(&tree)[1..],
            &["alpha", "beta", ".hidden", "file_a.txt", "file_b.rs"]
        );
        assert_eq!(tree.root().unwrap().path(), root_path(&dir));
        assert!(tree.root().unwrap().is_expanded());
        assert_eq!(tree.root().unwrap().child_range(), Some(1..6));
        assert_eq!(
            sink.updates(),
            vec![TreeUpdate::inserted(0, 1), TreeUpdate::inserted(1, 5)]
        );
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn expand_marks_loading_synchronously() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let alpha = root_path(&dir).join("alpha");

        tree.expand(&alpha);
        let node = tree.node(&alpha).unwrap();
        assert!(node.is_expanded());
        assert!(node.is_loading());
        assert!(node.child_range().is_none());
        assert!(tree.expanded_paths().contains(&alpha));
        tree.check_invariants().unwrap();

        tree.settle().await;
        let node = tree.node(&alpha).unwrap();
        assert!(!node.is_loading());
        assert_eq!(node.child_range(), Some(2..4));
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn children_get_parent_depth_plus_one() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let alpha = root_path(&dir).join("alpha");
        tree.expand(&alpha);
        tree.settle().await;

        let nested = tree.node(&alpha.join("nested")).unwrap();
        assert_eq!(nested.depth(), 2);
        assert_eq!(nested.parent(), Some(alpha.as_path()));
    }

    #[tokio::test]
    async fn expand_file_is_noop() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        tree.expand(&root_path(&dir).join("file_a.txt"));
        assert!(!tree.is_loading());
        tree.settle().await;
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn double_expand_lists_once() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        let alpha = root_path(&dir).join("alpha");

        tree.expand(&alpha);
        tree.expand(&alpha);
        assert_eq!(tree.pending_count(), 1);
        tree.settle().await;

        assert_eq!(sink.updates(), vec![TreeUpdate::inserted(2, 2)]);
        assert_eq!(tree.len(), 8);
    }

    #[tokio::test]
    async fn collapse_removes_all_descendants_not_node() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        let alpha = root_path(&dir).join("alpha");
        tree.expand(&alpha);
        tree.settle().await;
        tree.expand(&alpha.join("nested"));
        tree.settle().await;
        sink.drain();

        let root = root_path(&dir);
        tree.collapse(&root);
        assert_eq!(tree.len(), 1);
        assert_eq!(sink.updates(), vec![TreeUpdate::removed(1, 7)]);
        assert!(tree.expanded_paths().is_empty());
        assert!(!tree.root().unwrap().is_expanded());
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn collapse_empty_directory_flips_state() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        let beta = root_path(&dir).join("beta");
        tree.expand(&beta);
        tree.settle().await;
        assert_eq!(tree.node(&beta).unwrap().child_range(), Some(3..3));
        sink.drain();

        tree.collapse(&beta);
        assert!(!tree.node(&beta).unwrap().is_expanded());
        assert_eq!(sink.updates(), vec![TreeUpdate::removed(3, 0)]);
    }

    #[tokio::test]
    async fn collapse_unexpanded_is_noop() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        tree.collapse(&root_path(&dir).join("alpha"));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn collapse_during_expand_discards_result() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        let alpha = root_path(&dir).join("alpha");
        let before: Vec<PathBuf> = tree.nodes().iter().map(|n| n.path().to_path_buf()).collect();

        tree.expand(&alpha);
        tree.collapse(&alpha);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tree.process_pending(), 0);
        tree.settle().await;

        let after: Vec<PathBuf> = tree.nodes().iter().map(|n| n.path().to_path_buf()).collect();
        assert_eq!(before, after);
        assert_eq!(sink.updates(), vec![TreeUpdate::removed(2, 0)]);
        assert!(!tree.node(&alpha).unwrap().is_expanded());
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn re_expand_supersedes_cancelled_request() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        let alpha = root_path(&dir).join("alpha");

        tree.expand(&alpha);
        tree.collapse(&alpha);
        tree.expand(&alpha);
        tree.settle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tree.process_pending();

        let inserts: Vec<TreeUpdate> = sink
            .updates()
            .into_iter()
            .filter(|u| u.kind == ChangeKind::Inserted)
            .collect();
        assert_eq!(inserts, vec![TreeUpdate::inserted(2, 2)]);
        assert_eq!(tree.len(), 8);
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn collapsing_ancestor_cancels_descendant_expand() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let root = root_path(&dir);
        let alpha = root.join("alpha");
        tree.expand(&alpha);
        tree.settle().await;

        tree.expand(&alpha.join("nested"));
        tree.collapse(&root);
        assert_eq!(tree.pending_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tree.process_pending(), 0);
        assert_eq!(tree.len(), 1);
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn round_trip_is_served_from_cache() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let alpha = root_path(&dir).join("alpha");

        tree.expand(&alpha);
        tree.settle().await;
        let first: Vec<PathBuf> = tree.nodes().iter().map(|n| n.path().to_path_buf()).collect();

        tree.collapse(&alpha);
        let hits_before = tree.cache().stats().hits;
        tree.expand(&alpha);
        tree.settle().await;
        let second: Vec<PathBuf> = tree.nodes().iter().map(|n| n.path().to_path_buf()).collect();

        assert_eq!(first, second);
        assert_eq!(tree.cache().stats().hits, hits_before + 1);
    }

    #[tokio::test]
    async fn toggle_flips_between_states() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let alpha = root_path(&dir).join("alpha");

        tree.toggle(&alpha);
        tree.settle().await;
        assert!(tree.node(&alpha).unwrap().is_expanded());
        tree.toggle(&alpha);
        assert!(!tree.node(&alpha).unwrap().is_expanded());
    }

    #[tokio::test]
    async fn mirror_tracks_concurrent_expands() {
        let dir = setup_test_dir();
        fs::create_dir(dir.path().join("beta").join("b1")).unwrap();
        File::create(dir.path().join("beta").join("b2.txt")).unwrap();
        let mirror = MirrorSink::new();
        let mut tree = TreeState::new(quiet_cache(), mirror.clone(), no_prime());
        tree.bootstrap(dir.path()).unwrap();
        tree.settle().await;

        let root = root_path(&dir);
        tree.expand(&root.join("beta"));
        tree.expand(&root.join("alpha"));
        tree.settle().await;
        tree.expand(&root.join("alpha").join("nested"));
        tree.expand(&root.join("beta").join("b1"));
        tree.settle().await;

        let paths: Vec<PathBuf> = tree.nodes().iter().map(|n| n.path().to_path_buf()).collect();
        assert_eq!(mirror.rows(), paths);
        tree.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn vanished_directory_is_logged_and_stays_collapsed() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        let beta = root_path(&dir).join("beta");
        fs::remove_dir(&beta).unwrap();

        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        {
            let _guard = tracing::subscriber::set_default(subscriber);
            tree.expand(&beta);
        }
        tree.settle().await;
        let node = tree.node(&beta).unwrap();
        assert!(!node.is_expanded());
        assert!(!node.is_directory());
        assert!(sink.is_empty());
        assert!(logs.contents().contains("directory vanished"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn bootstrap_missing_root_leaves_tree_empty() {
        let dir = TempDir::new().unwrap();
        let sink = RecordingSink::new();
        let mut tree = TreeState::new(quiet_cache(), sink.clone(), no_prime());

        let err = tree.bootstrap(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, TreeError::InvalidRoot { .. }));
        assert!(tree.is_empty());
        assert!(sink.is_empty());
        tree.settle().await;
    }

    #[tokio::test]
    async fn bootstrap_file_root_has_single_row() {
        let dir = setup_test_dir();
        let sink = RecordingSink::new();
        let mut tree = TreeState::new(quiet_cache(), sink.clone(), no_prime());
        tree.bootstrap(&dir.path().join("file_a.txt")).unwrap();
        tree.settle().await;
        assert_eq!(tree.len(), 1);
        assert!(!tree.root().unwrap().is_expanded());
    }

    #[tokio::test]
    async fn rebootstrap_replaces_rows() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        tree.bootstrap(&dir.path().join("alpha")).unwrap();
        tree.settle().await;

        assert_eq!(names(&tree), vec!["alpha", "nested", "inner.txt"]);
        assert_eq!(
            sink.updates(),
            vec![
                TreeUpdate::removed(0, 6),
                TreeUpdate::inserted(0, 1),
                TreeUpdate::inserted(1, 2)
            ]
        );
    }

    #[tokio::test]
    async fn bootstrap_primes_cache() {
        let dir = setup_test_dir();
        let cache = quiet_cache();
        let mut tree = TreeState::new(Arc::clone(&cache), RecordingSink::new(), TreeOptions::default());
        tree.bootstrap(dir.path()).unwrap();
        tree.settle().await;

        for _ in 0..100 {
            if !cache.is_priming() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.contains(&root_path(&dir).join("alpha").join("nested")));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_stops_expands() {
        let dir = setup_test_dir();
        let (mut tree, sink) = loaded(&dir).await;
        sink.drain();
        let alpha = root_path(&dir).join("alpha");

        tree.expand(&alpha);
        tree.shutdown();
        tree.shutdown();
        assert!(tree.is_shut_down());
        assert!(!tree.is_loading());
        assert!(!tree.node(&alpha).unwrap().is_expanded());
        tree.check_invariants().unwrap();
        assert!(tree.shutdown_and_wait(Duration::from_secs(2)).await);

        tree.expand(&root_path(&dir).join("beta"));
        assert!(!tree.next_update().await);
        assert_eq!(tree.process_pending(), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn expanded_nodes_follow_list_order() {
        let dir = setup_test_dir();
        let (mut tree, _sink) = loaded(&dir).await;
        let root = root_path(&dir);
        let alpha = root.join("alpha");
        let nested = alpha.join("nested");
        let beta = root.join("beta");

        tree.expand(&beta);
        tree.expand(&alpha);
        tree.settle().await;
        tree.expand(&nested);
        tree.settle().await;

        let expanded: Vec<PathBuf> = tree
            .expanded_nodes()
            .iter()
            .map(|n| n.path().to_path_buf())
            .collect();
        assert_eq!(expanded, vec![root.clone(), alpha.clone(), nested, beta.clone()]);

        tree.collapse(&alpha);
        let expanded: Vec<&Path> = tree.expanded_nodes().iter().map(|n| n.path()).collect();
        assert_eq!(expanded, vec![root.as_path(), beta.as_path()]);
        assert_eq!(tree.expanded_paths().len(), 2);
    }

    #[test]
    fn tree_on_plain_thread_uses_cache_runtime() {
        let dir = setup_test_dir();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cache = Arc::new(DirectoryCache::with_runtime(
            CacheOptions {
                max_entries: 64,
                workers: 2,
                trim_interval: Some(Duration::from_secs(60)),
            },
            rt.handle().clone(),
        ));
        let mut tree = TreeState::new(Arc::clone(&cache), NullSink, TreeOptions::default());

        tree.bootstrap(dir.path()).unwrap();
        assert!(tree.root().unwrap().is_loading());
        rt.block_on(tree.settle());
        assert_eq!(tree.len(), 6);

        tree.expand(&root_path(&dir).join("alpha"));
        rt.block_on(tree.settle());
        assert_eq!(tree.len(), 8);
        tree.check_invariants().unwrap();
        assert!(rt.block_on(tree.shutdown_and_wait(Duration::from_secs(2))));
    }

    #[test]
    fn tree_without_any_runtime_lists_on_threads() {
        let dir = setup_test_dir();
        let cache = Arc::new(DirectoryCache::new(CacheOptions::default()));
        assert!(cache.runtime().is_none());
        let mut tree = TreeState::new(Arc::clone(&cache), NullSink, TreeOptions::default());

        tree.bootstrap(dir.path()).unwrap();
        assert!(!cache.is_priming());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while tree.is_loading() && std::time::Instant::now() < deadline {
            tree.process_pending();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!tree.is_loading());
        assert_eq!(tree.len(), 6);
        assert!(cache.contains(&root_path(&dir)));
        tree.check_invariants().unwrap();
        tree.shutdown();
    }

    #[test]
    fn root_access_checks_real_permissions() {
        let dir = setup_test_dir();
        assert_eq!(check_root_access(dir.path()), RootAccess::ReadWrite);
        assert_eq!(
            check_root_access(&dir.path().join("file_a.txt")),
            RootAccess::ReadWrite
        );
        assert!(matches!(
            check_root_access(&dir.path().join("missing")),
            RootAccess::Unreadable(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn root_access_on_locked_directory_matches_what_can_be_created() {
        use std::os::unix::fs::PermissionsExt;

        let dir = setup_test_dir();
        let locked = dir.path().join("alpha");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        // Privileged users can still write here despite the mode bits.
        let can_create = File::create(locked.join("write_check")).is_ok();
        let _ = fs::remove_file(locked.join("write_check"));

        let expected = if can_create {
            RootAccess::ReadWrite
        } else {
            RootAccess::ReadOnly
        };
        assert_eq!(check_root_access(&locked), expected);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    }
}
