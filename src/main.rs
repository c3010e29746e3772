use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use lazytree::config::{AppConfig, CacheConfig, LoggingConfig, TreeConfig};
use lazytree::{logging, DirectoryCache, LogSink, Node, TreeState};

/// How long shutdown waits for background listings to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Print a directory tree, expanded lazily through the background cache.
#[derive(Parser, Debug)]
#[command(name = "ftree", version, about)]
struct Cli {
    /// Root path to display (defaults to the configured root, then ".")
    path: Option<PathBuf>,

    /// Config file to load on top of the discovered ones
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of levels to reveal below the root
    #[arg(long, default_value_t = 1)]
    depth: usize,

    /// Emit rows as JSON instead of an indented listing
    #[arg(long)]
    json: bool,

    /// Do not prime the directory cache on bootstrap
    #[arg(long)]
    no_prime: bool,

    /// Maximum memoized directories
    #[arg(long, value_name = "N")]
    max_entries: Option<usize>,

    /// Priming worker pool size
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Log filter, e.g. "debug" or "lazytree=trace"
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Flags expressed as a partial config so they merge over file values.
    fn overrides(&self) -> AppConfig {
        AppConfig {
            tree: TreeConfig {
                root: self.path.as_ref().map(|p| p.display().to_string()),
                prime_on_bootstrap: self.no_prime.then_some(false),
            },
            cache: CacheConfig {
                max_entries: self.max_entries,
                workers: self.workers,
                trim_interval_ms: None,
            },
            logging: LoggingConfig {
                level: self.log_level.clone(),
                file: self.log_file.as_ref().map(|p| p.display().to_string()),
            },
        }
    }
}

/// One printed row.
#[derive(Debug, Serialize)]
struct Row<'a> {
    path: &'a Path,
    name: &'a str,
    depth: usize,
    is_dir: bool,
    expanded: bool,
}

impl<'a> From<&'a Node> for Row<'a> {
    fn from(node: &'a Node) -> Self {
        Self {
            path: node.path(),
            name: node.name(),
            depth: node.depth(),
            is_dir: node.is_directory(),
            expanded: node.is_expanded(),
        }
    }
}

/// Expand every collapsed directory sitting at `depth`, then wait for all of them.
async fn reveal_level(tree: &mut TreeState, depth: usize) {
    let targets: Vec<PathBuf> = tree
        .nodes()
        .iter()
        .filter(|n| n.depth() == depth && n.is_directory() && !n.is_expanded())
        .map(|n| n.path().to_path_buf())
        .collect();
    for path in &targets {
        tree.expand(path);
    }
    tree.settle().await;
}

fn print_rows(nodes: &[Node], json: bool) -> lazytree::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if json {
        let rows: Vec<Row<'_>> = nodes.iter().map(Row::from).collect();
        serde_json::to_writer_pretty(&mut out, &rows)
            .map_err(|e| lazytree::TreeError::Io(e.into()))?;
        writeln!(out)?;
    } else {
        for node in nodes {
            let marker = match (node.is_directory(), node.is_expanded()) {
                (true, true) => "▾ ",
                (true, false) => "▸ ",
                (false, _) => "  ",
            };
            writeln!(
                out,
                "{}{}{}",
                "  ".repeat(node.depth()),
                marker,
                node.name()
            )?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> lazytree::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides()));
    let _log_guard = logging::init(&config.logging_settings())?;

    let root = config.root().unwrap_or_else(|| PathBuf::from("."));
    let cache = Arc::new(DirectoryCache::new(config.cache_options()));
    let opts = cache.options();
    info!(
        max_entries = opts.max_entries,
        workers = opts.workers,
        trim_interval_ms = opts.trim_interval.map(|d| d.as_millis() as u64),
        "directory cache ready"
    );
    let mut tree = TreeState::new(Arc::clone(&cache), LogSink, config.tree_options());

    if let Err(e) = tree.bootstrap(&root) {
        warn!(error = %e, "bootstrap reported a problem");
    }
    tree.settle().await;

    for depth in 1..cli.depth {
        reveal_level(&mut tree, depth).await;
    }

    print_rows(tree.nodes(), cli.json)?;

    let stats = cache.stats();
    info!(
        rows = tree.len(),
        cached = stats.entries,
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        "done"
    );

    if !tree.shutdown_and_wait(SHUTDOWN_GRACE).await {
        warn!("background listings did not stop in time");
    }
    Ok(())
}
