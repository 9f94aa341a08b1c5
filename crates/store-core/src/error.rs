//! Error types shared by the merge engine and its storage layer.

use thiserror::Error;

/// Result type alias used throughout the `syncstore` crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the concurrent merge engine (spec §7).
#[derive(Debug, Error)]
pub enum Error {
    /// Package root exists but is not a directory, or `devices/` is a plain file.
    #[error("corrupt package at {path}: {reason}")]
    CorruptPackage { path: String, reason: String },

    /// File or database I/O failed.
    #[error("io failure: {0}")]
    IoFailure(String),

    /// Property-list encode/decode failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// A synchronous API was invoked from within the memory queue's own stack.
    #[error("reentrant misuse: {0} may not be called from the memory queue")]
    ReentrantMisuse(String),

    /// The store has not finished loading (or failed to load).
    #[error("store not loaded")]
    NotLoaded,

    /// `insert_changes` in append-only mode rejected a stale batch.
    #[error("conflict: change at {attempted} is not after cursor {cursor}")]
    Conflict { attempted: i64, cursor: i64 },

    /// The store's package has been deleted from disk.
    #[error("store package deleted")]
    Deleted,
}

impl Error {
    pub fn corrupt_package(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptPackage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn io(reason: impl std::fmt::Display) -> Self {
        Self::IoFailure(reason.to_string())
    }

    pub fn encoding(reason: impl Into<String>) -> Self {
        Self::Encoding(reason.into())
    }

    pub fn reentrant(op: impl Into<String>) -> Self {
        Self::ReentrantMisuse(op.into())
    }

    /// True if this error reflects a single-row problem that a sync pass
    /// should log and skip rather than abort on (spec §7 policy).
    pub fn is_row_local(&self) -> bool {
        matches!(self, Self::Encoding(_) | Self::IoFailure(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_local_classification() {
        assert!(Error::encoding("bad tag").is_row_local());
        assert!(Error::io("disk full").is_row_local());
        assert!(!Error::NotLoaded.is_row_local());
        assert!(!Error::Deleted.is_row_local());
    }
}
