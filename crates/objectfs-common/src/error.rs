//! Error types for objectfs
//!
//! This module defines the common error type used throughout the engine.

use thiserror::Error;

/// Common result type for objectfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for objectfs
#[derive(Debug, Error)]
pub enum Error {
    // OS-level errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of space")]
    NoSpace,

    #[error("operation not supported: {0}")]
    NotSupported(String),

    // Engine errors
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("object already exists: {0}")]
    ObjectExists(String),

    #[error("collection already exists: {0}")]
    CollectionExists(String),

    #[error("collection not empty: {0}")]
    CollectionNotEmpty(String),

    #[error("store is in use (fsid is locked by another process)")]
    StoreBusy,

    #[error("incompatible on-disk features: {0}")]
    IncompatibleFeatures(String),

    #[error("stale store version {on_disk}, engine wants {wanted}")]
    StaleVersion { on_disk: u32, wanted: u32 },

    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt data: {0}")]
    Corrupt(String),

    // Journal errors
    #[error("journal error: {0}")]
    Journal(String),

    #[error("journal is full")]
    JournalFull,

    // Key/value store errors
    #[error("omap error: {0}")]
    Omap(String),

    // Configuration / misc
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create an omap error
    pub fn omap(msg: impl Into<String>) -> Self {
        Self::Omap(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Check if this is a not-found error (missing object, collection,
    /// attribute or omap entry)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ObjectNotFound(_) | Self::CollectionNotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Check if this is an already-exists error
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::ObjectExists(_) | Self::CollectionExists(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// Check if this error means the filesystem ran out of space
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        match self {
            Self::NoSpace => true,
            Self::Io(e) => e.raw_os_error() == Some(libc_enospc()),
            _ => false,
        }
    }
}

// Avoid dragging libc into this crate for one constant.
const fn libc_enospc() -> i32 {
    28 // ENOSPC on every unix we run on
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::ObjectNotFound("x".into()).is_not_found());
        assert!(
            Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found()
        );
        assert!(!Error::JournalFull.is_not_found());
    }

    #[test]
    fn test_no_space_predicate() {
        assert!(Error::NoSpace.is_no_space());
        assert!(Error::Io(std::io::Error::from_raw_os_error(28)).is_no_space());
        assert!(!Error::ObjectExists("x".into()).is_no_space());
    }
}
