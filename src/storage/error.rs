//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Cache is full: {capacity} resources already resident")]
    CacheFull { capacity: usize },

    #[error("Memory budget too small: {pages} pages (min: {min})")]
    MemoryTooSmall { pages: u64, min: u64 },

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Data item not found: uid {0:#x}")]
    ItemNotFound(u64),

    #[error("Data item too large: {size} bytes (max: {max})")]
    DataTooLarge { size: usize, max: usize },

    #[error("Database busy: no page with {required} free bytes could be found")]
    DatabaseBusy { required: usize },

    #[error("Bad log file: {0}")]
    BadLogFile(String),

    #[error("Corrupt page {page}: {reason}")]
    CorruptPage { page: PageId, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("File does not exist: {0}")]
    FileNotExists(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true for the "expected absence" kinds that `read` reports as `None`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PageNotFound(_) | Self::ItemNotFound(_))
    }

    /// Returns true if the error means on-disk state cannot be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::BadLogFile(_) | Self::CorruptPage { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
