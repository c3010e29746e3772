use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Tree engine error types.
#[derive(Debug, Error)]
pub enum TreeError {
    /// Root path missing or unreadable. Logged by the engine, never fatal.
    #[error("Invalid root {}: {reason}", path.display())]
    InvalidRoot { path: PathBuf, reason: String },

    /// A directory could not be listed (deleted, permission denied, ...).
    #[error("Listing failed for {}: {source}", path.display())]
    ListingFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O errors from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or logging setup errors.
    #[error("Config error: {0}")]
    Config(String),
}

impl TreeError {
    pub(crate) fn invalid_root(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TreeError::InvalidRoot {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
