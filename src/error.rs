//! Error types for the patch engine.
//!
//! Validation outcomes are never errors: they travel as
//! [`ValidationResult`](crate::validation::ValidationResult) values. Everything
//! here aborts the phase that raised it.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Type alias for Results in the patch engine
pub type Result<T> = std::result::Result<T, PatchError>;

/// Main error type for build, apply and revert operations
#[derive(Debug, Error)]
pub enum PatchError {
    /// I/O failure on a specific path
    #[error("I/O error on {path:?}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Archive could not be read or written
    #[error("Archive error in {path:?}: {source}")]
    Zip {
        /// Archive path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: zip::result::ZipError,
    },

    /// Archive is empty or unreadable while diffing entries
    #[error("Corrupted or empty archive: {0:?}")]
    CorruptArchive(PathBuf),

    /// Walking a directory tree failed
    #[error("Failed to walk {path:?}: {source}")]
    Walk {
        /// Root being walked
        path: PathBuf,
        /// Underlying error
        #[source]
        source: walkdir::Error,
    },

    /// Path cannot be represented in the patch (non UTF-8)
    #[error("Unsupported path: {0:?}")]
    UnsupportedPath(PathBuf),

    /// Invalid glob in ignored/critical/optional/strict/delete lists
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Patch container does not start with the expected magic
    #[error("Invalid patch file: missing magic header")]
    BadMagic,

    /// Patch container was written by another format version
    #[error("Unsupported patch version: {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the container
        found: u32,
        /// Version this build understands
        expected: u32,
    },

    /// Container (de)serialization failed
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Configuration file could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Payload bytes for an action are absent from the container
    #[error("Missing payload for {0}")]
    MissingPayload(String),

    /// Written content does not have the signature the patch expects
    #[error("Checksum mismatch for {path}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Tree-relative path
        path: String,
        /// Expected signature
        expected: String,
        /// Signature found after the write
        actual: String,
    },

    /// A move-sourced update has neither its source nor a payload fallback
    #[error("Move source {source_path} for {path} is not available")]
    MissingSource {
        /// Tree-relative target path
        path: String,
        /// Tree-relative source path
        source_path: String,
    },

    /// Apply refused to start because validation errors were left unresolved
    #[error("Apply blocked by {0} unresolved validation error(s)")]
    Blocked(usize),

    /// Some actions could not be reverted
    #[error("Revert failed for {} action(s): {}", .0.len(), .0.join("; "))]
    RevertFailed(Vec<String>),

    /// Cooperative cancellation requested through the UI
    #[error("Operation cancelled")]
    Cancelled,
}

impl PatchError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap an archive error with the archive path
    pub fn zip(path: impl AsRef<Path>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error is the distinguished cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the failure looks like a transient lock that may clear on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_lock_error(source),
            _ => false,
        }
    }
}

/// Errors a locked or in-use file produces
pub(crate) fn is_lock_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if matches!(
        err.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ResourceBusy | ErrorKind::ExecutableFileBusy
    ) {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32) | Some(33))
}

/// Extension to attach a path to raw `std::io` results
pub(crate) trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| PatchError::io(path, e))
    }
}
