use std::fs;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Type of filesystem node.
///
/// Symlinks are classified by their target; entries whose type cannot be
/// determined (broken link, permission error) are treated as files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Directory,
    File,
}

impl NodeKind {
    /// Classify a path by following symlinks.
    pub fn probe(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => NodeKind::Directory,
            _ => NodeKind::File,
        }
    }
}

/// One filesystem entry in the visible tree.
///
/// Identity is the path: two nodes with the same path compare and hash equal
/// regardless of their presentation state.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) path: PathBuf,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    /// Lookup key of the parent, not an owning edge.
    pub(crate) parent: Option<PathBuf>,
    pub(crate) depth: usize,
    pub(crate) expanded: bool,
    pub(crate) loading: bool,
    /// Descendant block in the flat list; only set while expanded and loaded.
    pub(crate) child_range: Option<Range<usize>>,
    /// Whether the entry itself is a symlink. Priming does not descend into these.
    pub(crate) is_symlink: bool,
}

impl Node {
    /// Create a depth-0 node for a tree root.
    pub fn root(path: &Path) -> Self {
        let mut node = Self::with_depth(path, 0);
        node.parent = None;
        node
    }

    /// Create a node for an entry inside `parent`, one level deeper.
    pub fn child(parent: &Path, parent_depth: usize, path: &Path) -> Self {
        let mut node = Self::with_depth(path, parent_depth + 1);
        node.parent = Some(parent.to_path_buf());
        node
    }

    fn with_depth(path: &Path, depth: usize) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let is_symlink = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        Self {
            name,
            path: path.to_path_buf(),
            kind: NodeKind::probe(path),
            parent: path.parent().map(Path::to_path_buf),
            depth,
            expanded: false,
            loading: false,
            child_range: None,
            is_symlink,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }

    /// Distance from the root; renderers use it for indentation.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// True while an expand is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_symlink(&self) -> bool {
        self.is_symlink
    }

    /// Half-open index range of this node's descendants in the flat list.
    pub fn child_range(&self) -> Option<Range<usize>> {
        self.child_range.clone()
    }

    /// Re-check the entry's type on disk and return whether it is a directory.
    pub fn refresh_kind(&mut self) -> bool {
        self.kind = NodeKind::probe(&self.path);
        self.is_directory()
    }

    /// A collapsed copy of this node placed at `depth` under `parent`.
    ///
    /// Used when cached children are spliced into the list, so that cached
    /// templates never carry presentation state.
    pub(crate) fn fresh_at(&self, parent: &Path, depth: usize) -> Self {
        Self {
            path: self.path.clone(),
            name: self.name.clone(),
            kind: self.kind,
            parent: Some(parent.to_path_buf()),
            depth,
            expanded: false,
            loading: false,
            child_range: None,
            is_symlink: self.is_symlink,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}
