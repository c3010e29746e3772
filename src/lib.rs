//! Lazily-expanding, incrementally-updating in-memory view of a filesystem
//! subtree.
//!
//! [`TreeState`] owns a flat, pre-order list of visible [`Node`]s and
//! reports every splice to an [`UpdateSink`]. A [`DirectoryCache`] lists
//! directories ahead of time so most expands never touch the disk.

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod sink;

pub use error::{Result, TreeError};
pub use fs::cache::{CacheOptions, CacheStatsSnapshot, DirectoryCache, PrimeHandle, PrimeReport};
pub use fs::diff::diff_snapshots;
pub use fs::node::{Node, NodeKind};
pub use fs::tree::{TreeOptions, TreeState};
pub use sink::{ChangeKind, LogSink, MirrorSink, NullSink, RecordingSink, TreeUpdate, UpdateSink};
