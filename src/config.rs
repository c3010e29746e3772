//! Engine configuration: TOML file loading, CLI overrides, and defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--config`, `--max-entries`, `--workers`, etc.)
//! 2. `$LAZYTREE_CONFIG` environment variable (path to config file)
//! 3. Project-local `.lazytree.toml` in the current working directory
//! 4. Global `~/.config/lazytree/config.toml`
//! 5. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::fs::cache::{default_workers, CacheOptions, DEFAULT_MAX_ENTRIES};
use crate::fs::tree::TreeOptions;
use crate::logging::LoggingSettings;

// ── Section configs ──────────────────────────────────────────────────────────

/// Tree settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TreeConfig {
    /// Root directory (overridden by CLI positional arg).
    pub root: Option<String>,
    /// Start priming the directory cache when the tree is bootstrapped.
    pub prime_on_bootstrap: Option<bool>,
}

/// Directory cache settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum memoized directories before the oldest are evicted.
    pub max_entries: Option<usize>,
    /// Priming worker pool size; defaults to host parallelism.
    pub workers: Option<usize>,
    /// Periodic trim interval in milliseconds; 0 disables it.
    pub trim_interval_ms: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "lazytree=debug".
    pub level: Option<String>,
    /// Log file path; stderr when unset.
    pub file: Option<String>,
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// Top-level configuration.
///
/// All fields are optional so that partial configs from different sources
/// can be merged together (CLI overrides file, file overrides defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tree: TreeConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

// ── Default constants ────────────────────────────────────────────────────────

/// Default periodic trim interval in milliseconds.
pub const DEFAULT_TRIM_INTERVAL_MS: u64 = 10_000;
/// Default log filter.
pub const DEFAULT_LOG_LEVEL: &str = "info";

// ── Config file locator ──────────────────────────────────────────────────────

/// Return the list of candidate config file paths in priority order.
///
/// Does NOT include the CLI `--config` path; that one is applied separately.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(env_path) = std::env::var("LAZYTREE_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".lazytree.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("lazytree").join("config.toml"));
    }

    paths
}

/// Try to read and parse a TOML config file. Returns `None` if the file
/// doesn't exist or can't be parsed (with a warning printed to stderr, since
/// logging is configured from this file and is not up yet).
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return None,
    };
    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            eprintln!(
                "Warning: failed to parse config file {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}

// ── Merge logic ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Merge `other` on top of `self`: `other`'s `Some` values win.
    pub fn merge(self, other: &AppConfig) -> AppConfig {
        AppConfig {
            tree: TreeConfig {
                root: other.tree.root.clone().or(self.tree.root),
                prime_on_bootstrap: other
                    .tree
                    .prime_on_bootstrap
                    .or(self.tree.prime_on_bootstrap),
            },
            cache: CacheConfig {
                max_entries: other.cache.max_entries.or(self.cache.max_entries),
                workers: other.cache.workers.or(self.cache.workers),
                trim_interval_ms: other
                    .cache
                    .trim_interval_ms
                    .or(self.cache.trim_interval_ms),
            },
            logging: LoggingConfig {
                level: other.logging.level.clone().or(self.logging.level),
                file: other.logging.file.clone().or(self.logging.file),
            },
        }
    }

    /// Load the final merged configuration.
    ///
    /// `cli_config_path` is an explicit config file path from `--config`.
    /// `cli_overrides` are partial overrides derived from CLI flags.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&AppConfig>) -> AppConfig {
        let mut config = AppConfig::default();

        // Walk in reverse so that highest-priority (env var) overwrites lower.
        for path in candidate_paths().iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(cli_path) = cli_config_path {
            if let Some(file_cfg) = load_file(cli_path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    /// Configured root path, if any.
    pub fn root(&self) -> Option<PathBuf> {
        self.tree.root.as_ref().map(PathBuf::from)
    }

    /// Whether bootstrap starts priming the cache.
    pub fn prime_on_bootstrap(&self) -> bool {
        self.tree.prime_on_bootstrap.unwrap_or(true)
    }

    /// Memo bound of the directory cache.
    pub fn max_entries(&self) -> usize {
        self.cache.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES)
    }

    /// Priming worker pool size, at least one.
    pub fn workers(&self) -> usize {
        self.cache.workers.unwrap_or_else(default_workers).max(1)
    }

    /// Periodic trim interval in milliseconds.
    pub fn trim_interval_ms(&self) -> u64 {
        self.cache
            .trim_interval_ms
            .unwrap_or(DEFAULT_TRIM_INTERVAL_MS)
    }

    /// Log filter directive.
    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Log file, if logging goes to a file.
    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging.file.as_ref().map(PathBuf::from)
    }

    // ── Resolved engine settings ────────────────────────────────────────────

    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions {
            prime_on_bootstrap: self.prime_on_bootstrap(),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        let trim = self.trim_interval_ms();
        CacheOptions {
            max_entries: self.max_entries(),
            workers: self.workers(),
            trim_interval: (trim > 0).then(|| Duration::from_millis(trim)),
        }
    }

    pub fn logging_settings(&self) -> LoggingSettings {
        LoggingSettings {
            level: self.log_level().to_string(),
            file: self.log_file(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
