//! Error types for the PMD32 emulator.
//!
//! These cover the storage and semantic failures surfaced to Rust callers
//! (drive table, storage backends, auto-mount store, CLI). Transport and
//! checksum failures on the wire are never errors; the engine absorbs them
//! as boolean outcomes of the current transaction.

use thiserror::Error;

/// Errors that can occur outside the wire protocol.
#[derive(Error, Debug)]
pub enum Pmd32Error {
    #[error("Invalid drive index: {0}")]
    InvalidDrive(u8),

    #[error("Image already mounted: {0}")]
    AlreadyMounted(String),

    #[error("Wrong image size: {path} is {size} bytes")]
    ImageSize { path: String, size: u64 },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Path escapes the storage root: {0}")]
    OutsideRoot(String),

    #[error("Read-only file")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for PMD32 operations.
pub type Pmd32Result<T> = Result<T, Pmd32Error>;
