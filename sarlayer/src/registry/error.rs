//! Error types for the registry store.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur while reading, writing, or rebuilding the registry.
///
/// Most of these never escape the store: [`crate::registry::RegistryStore::load`]
/// falls back to an empty registry and `atomic_update` retries and reports a
/// boolean. They surface from maintenance operations (rebuild, audit) and in
/// the warnings logged for failed attempts.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The registry document is not valid JSON or has the wrong shape.
    #[error("corrupt registry {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Failed to serialize the registry.
    #[error("failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The record written by an update was not found when read back.
    #[error("update for scene {scene_id} not visible after write")]
    VerificationFailed { scene_id: String },

    /// Could not obtain the registry lock in time.
    #[error("timed out after {waited_secs}s waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_secs: u64 },

    /// A path about to be registered does not refer to a non-empty file.
    #[error("output {} is missing or empty", path.display())]
    MissingOutput { path: PathBuf },

    /// Evidence for a rebuild could not be collected.
    #[error("evidence scan failed: {0}")]
    Evidence(String),
}

impl RegistryError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether another attempt of the same update might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegistryError::MissingOutput { .. })
    }
}
