//! Background directory cache.
//!
//! Memoizes sorted child lists keyed by directory path and fills itself by
//! walking whole subtrees off the expand path:
//! - one priming pass at a time, fanned out over a bounded worker pool
//! - insertion-order eviction once the memo exceeds its bound, on a fixed-rate
//!   timer (or on insert when the timer is disabled)
//! - hit/miss/eviction statistics for monitoring
//!
//! Entries are never invalidated on filesystem changes; [`DirectoryCache::clear`]
//! is the only reset.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::fs::listing::list_children;
use crate::fs::node::{Node, NodeKind};

/// Default maximum number of memoized directories.
pub const DEFAULT_MAX_ENTRIES: usize = 128;

/// Default interval between periodic trims.
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(10);

/// Worker pool size when host parallelism cannot be determined.
const FALLBACK_WORKERS: usize = 4;

/// Host parallelism, used as the default priming pool size.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}

/// Tuning for a [`DirectoryCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    pub max_entries: usize,
    pub workers: usize,
    /// `None` disables the periodic trim task.
    pub trim_interval: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            workers: default_workers(),
            trim_interval: Some(DEFAULT_TRIM_INTERVAL),
        }
    }
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of one priming pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimeReport {
    /// Directories listed and stored.
    pub directories: usize,
    /// Directories whose listing failed.
    pub failures: usize,
    /// Whether the pass stopped early because of shutdown.
    pub cancelled: bool,
}

/// Handle to a running priming pass.
pub struct PrimeHandle {
    handle: JoinHandle<PrimeReport>,
}

impl PrimeHandle {
    /// Wait for the pass to finish or be cancelled.
    pub async fn wait(self) -> PrimeReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "priming task ended abnormally");
                PrimeReport {
                    cancelled: true,
                    ..PrimeReport::default()
                }
            }
        }
    }
}

/// One directory waiting to be listed by a priming pass.
struct PrimeJob {
    dir: PathBuf,
    depth: usize,
    ancestors: Option<Arc<Ancestry>>,
}

/// Resolved paths of the directories a priming job was reached through.
struct Ancestry {
    dir: PathBuf,
    parent: Option<Arc<Ancestry>>,
}

impl Ancestry {
    fn contains(&self, dir: &Path) -> bool {
        let mut link = Some(self);
        while let Some(node) = link {
            if node.dir == dir {
                return true;
            }
            link = node.parent.as_deref();
        }
        false
    }
}

/// Memo of sorted child lists, filled eagerly in the background.
pub struct DirectoryCache {
    memo: RwLock<IndexMap<PathBuf, Arc<[Node]>>>,
    options: CacheOptions,
    priming: AtomicBool,
    trimming: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    runtime: Option<Handle>,
    stats: CacheStats,
}

impl DirectoryCache {
    /// Create a cache bound to the runtime current on the calling thread, if any.
    ///
    /// Without a runtime, priming and the trim timer are unavailable. The
    /// bound is then enforced on every insert.
    pub fn new(options: CacheOptions) -> Self {
        Self::build(options, Handle::try_current().ok())
    }

    /// Create a cache whose background work runs on `runtime`.
    ///
    /// Use this when the owner lives on a thread without a runtime context.
    pub fn with_runtime(options: CacheOptions, runtime: Handle) -> Self {
        Self::build(options, Some(runtime))
    }

    fn build(options: CacheOptions, runtime: Option<Handle>) -> Self {
        Self {
            memo: RwLock::new(IndexMap::new()),
            options: CacheOptions {
                workers: options.workers.max(1),
                ..options
            },
            priming: AtomicBool::new(false),
            trimming: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            runtime,
            stats: CacheStats::default(),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Runtime background work is spawned on.
    pub fn runtime(&self) -> Option<&Handle> {
        self.runtime.as_ref()
    }

    /// Whether a running trim timer enforces the bound instead of `insert`.
    fn trims_on_timer(&self) -> bool {
        self.trimming.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Memoized sorted children of `dir`, if present. Never blocks on I/O.
    pub fn lookup(&self, dir: &Path) -> Option<Arc<[Node]>> {
        let found = self.memo.read().get(dir).cloned();
        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store the sorted children of `dir`.
    ///
    /// While the trim timer runs the memo may exceed its bound until the next
    /// tick. Otherwise the oldest entries are evicted right away.
    pub fn insert(&self, dir: PathBuf, children: Vec<Node>) {
        let eager = !self.trims_on_timer();
        let evicted = {
            let mut memo = self.memo.write();
            memo.insert(dir, children.into());
            if eager {
                Self::evict_excess(&mut memo, self.options.max_entries)
            } else {
                0
            }
        };
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
        }
    }

    /// Evict the oldest entries beyond the configured bound.
    pub fn trim(&self) -> usize {
        let evicted = Self::evict_excess(&mut self.memo.write(), self.options.max_entries);
        if evicted > 0 {
            self.stats
                .evictions
                .fetch_add(evicted as u64, Ordering::Relaxed);
            debug!(evicted, "trimmed directory cache");
        }
        evicted
    }

    fn evict_excess(memo: &mut IndexMap<PathBuf, Arc<[Node]>>, max_entries: usize) -> usize {
        let excess = memo.len().saturating_sub(max_entries);
        if excess > 0 {
            memo.drain(..excess);
        }
        excess
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.memo.write().clear();
        debug!("directory cache cleared");
    }

    pub fn len(&self) -> usize {
        self.memo.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.read().is_empty()
    }

    pub fn contains(&self, dir: &Path) -> bool {
        self.memo.read().contains_key(dir)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            inserts: self.stats.inserts.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    pub fn is_priming(&self) -> bool {
        self.priming.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Start listing every directory reachable from `roots` in the background.
    ///
    /// Symlinked directories are followed. A link that leads back to one of
    /// its own ancestors is listed but not descended into.
    ///
    /// Returns `None` when a pass is already running, the cache is shut down,
    /// or there is no runtime to run it on.
    pub fn prime_subtree(self: &Arc<Self>, roots: &[Node]) -> Option<PrimeHandle> {
        if self.cancel.is_cancelled() {
            debug!("priming requested after shutdown, ignoring");
            return None;
        }
        let Some(runtime) = self.runtime.clone() else {
            warn!("no async runtime available, directory priming disabled");
            return None;
        };
        if self
            .priming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("directory priming already running, ignoring request");
            return None;
        }

        let seeds: VecDeque<PrimeJob> = roots
            .iter()
            .filter(|n| n.is_directory())
            .map(|n| PrimeJob {
                dir: n.path().to_path_buf(),
                depth: n.depth(),
                ancestors: None,
            })
            .collect();
        info!(roots = seeds.len(), workers = self.options.workers, "directory priming started");

        let cache = Arc::clone(self);
        let handle = self.tracker.spawn_on(
            async move {
                let report = cache.run_prime(seeds).await;
                cache.priming.store(false, Ordering::Release);
                info!(
                    directories = report.directories,
                    failures = report.failures,
                    cancelled = report.cancelled,
                    "directory priming finished"
                );
                report
            },
            &runtime,
        );
        Some(PrimeHandle { handle })
    }

    async fn run_prime(&self, mut queue: VecDeque<PrimeJob>) -> PrimeReport {
        let mut report = PrimeReport::default();
        let mut workers = JoinSet::new();

        loop {
            while workers.len() < self.options.workers {
                let Some(job) = queue.pop_front() else {
                    break;
                };
                workers.spawn_blocking(move || {
                    let real = job.dir.canonicalize().unwrap_or_else(|_| job.dir.clone());
                    let listed = list_children(&job.dir, job.depth);
                    (job, real, listed)
                });
            }
            if workers.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    report.cancelled = true;
                    break;
                }
                joined = workers.join_next() => joined,
            };

            match joined {
                Some(Ok((job, real, Ok(children)))) => {
                    let cycle = job
                        .ancestors
                        .as_deref()
                        .is_some_and(|chain| chain.contains(&real));
                    if cycle {
                        debug!(path = %job.dir.display(), "symlink cycle, not descending");
                    } else {
                        let chain = Arc::new(Ancestry {
                            dir: real,
                            parent: job.ancestors,
                        });
                        queue.extend(
                            children
                                .iter()
                                .filter(|c| c.kind() == NodeKind::Directory)
                                .map(|c| PrimeJob {
                                    dir: c.path().to_path_buf(),
                                    depth: job.depth + 1,
                                    ancestors: Some(Arc::clone(&chain)),
                                }),
                        );
                    }
                    self.insert(job.dir, children);
                    report.directories += 1;
                }
                Some(Ok((job, _, Err(e)))) => {
                    debug!(path = %job.dir.display(), error = %e, "priming skipped unreadable directory");
                    report.failures += 1;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "priming worker failed");
                    report.failures += 1;
                }
                None => break,
            }
        }
        report
    }

    /// Start the periodic trim task if configured. Returns whether one was started.
    pub fn spawn_periodic_trim(self: &Arc<Self>) -> bool {
        let (Some(period), Some(runtime)) = (self.options.trim_interval, self.runtime.as_ref())
        else {
            return false;
        };
        if self.cancel.is_cancelled() || self.trimming.swap(true, Ordering::AcqRel) {
            return false;
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.tracker.spawn_on(
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => match cache.upgrade() {
                            Some(cache) => {
                                cache.trim();
                            }
                            None => break,
                        },
                    }
                }
            },
            runtime,
        );
        true
    }

    /// Cancel priming and the trim task without waiting for them. Idempotent.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!("directory cache shutting down");
        }
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Wait up to `timeout` for background tasks to exit after [`shutdown`](Self::shutdown).
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

impl Drop for DirectoryCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
