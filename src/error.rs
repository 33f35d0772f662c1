//! Error types for lsmstore
//!
//! Provides a unified error type for all operations. A missing key is never
//! an error: lookups return `Ok(None)`.

use thiserror::Error;

/// Result type alias using LsmError
pub type Result<T> = std::result::Result<T, LsmError>;

/// Unified error type for lsmstore operations
#[derive(Debug, Error)]
pub enum LsmError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    /// Filesystem failure on read/write/rename. Retriable.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Segment Errors
    // -------------------------------------------------------------------------
    /// On-disk descriptor or body inconsistent with file content.
    #[error("Segment corruption detected: {0}")]
    Corruption(String),

    /// Caller contract violated (e.g. unsorted input to a segment writer)
    #[error("Storage error: {0}")]
    Storage(String),

    // -------------------------------------------------------------------------
    // Compaction Errors
    // -------------------------------------------------------------------------
    /// Merge failed; input segments remain valid and untouched.
    #[error("Compaction failed: {0}")]
    Compaction(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LsmError {
    /// Wrap any failure raised while merging into a `Compaction` error.
    ///
    /// Already-wrapped errors are passed through unchanged.
    pub fn into_compaction(self) -> Self {
        match self {
            LsmError::Compaction(_) => self,
            other => LsmError::Compaction(other.to_string()),
        }
    }

    /// True for errors that mean on-disk data cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(self, LsmError::Corruption(_) | LsmError::WalCorruption(_))
    }
}

impl From<bincode::Error> for LsmError {
    fn from(e: bincode::Error) -> Self {
        LsmError::Serialization(e.to_string())
    }
}
