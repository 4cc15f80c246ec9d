//! Error types for masterkey-migrate
//!
//! A single error enum covers storage, crypto, configuration and run
//! control failures. The rewriter distinguishes transform failures
//! (expected, recovered per file) from everything else.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from the storage backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Path does not exist in storage
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// Encrypt/decrypt of a single file failed during copy
    #[error("Transform failed for '{}': {reason}", path.display())]
    Transform { path: PathBuf, reason: String },

    /// A stray temporary target could not be removed
    #[error("Failed to clean up '{}': {reason}", path.display())]
    CleanupFailed { path: PathBuf, reason: String },

    /// Directory listing failed during a tree walk
    #[error("Failed to list '{}': {reason}", path.display())]
    Listing { path: PathBuf, reason: String },

    /// A user backend failed to return a page
    #[error("User backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },

    /// Configuration file could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration is present but unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Key material is missing
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Cryptographic primitive failure (not tied to a specific file)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Another re-encryption run is active in this process
    #[error("A re-encryption run is already in progress")]
    RunInProgress,

    /// A user's pass exceeded its time budget
    #[error("Timed out after {secs}s processing user '{user}'")]
    Timeout { user: String, secs: u64 },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a transform error for `path`
    pub fn transform(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Error::Transform {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Whether this is a per-file transform failure
    pub fn is_transform(&self) -> bool {
        matches!(self, Error::Transform { .. })
    }

    /// Warning-level errors are reported but never gate the run
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::CleanupFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let transform = Error::transform("/alice/files/a.txt", "bad tag");
        assert!(transform.is_transform());
        assert!(!transform.is_warning());

        let cleanup = Error::CleanupFailed {
            path: PathBuf::from("/alice/files/a.txt.decrypted.1"),
            reason: "busy".to_string(),
        };
        assert!(cleanup.is_warning());
        assert!(!cleanup.is_transform());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert!(!io.is_transform());
    }

    #[test]
    fn test_display_includes_path() {
        let err = Error::transform("/bob/files/x", "authentication failed");
        assert_eq!(
            err.to_string(),
            "Transform failed for '/bob/files/x': authentication failed"
        );
    }
}
