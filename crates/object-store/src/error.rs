//! Error types for the object store.

use std::fmt;

use thiserror::Error;

use crate::metadata::MetadataError;
use crate::session::SessionError;

/// Result alias used throughout the crate.
pub type Result<T, E = ObjectStoreError> = std::result::Result<T, E>;

/// The phase of an operation in which a collaborator failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Get,
    Put,
    Remove,
    List,
    CreateBucket,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Open => "open",
            Phase::Get => "get",
            Phase::Put => "put",
            Phase::Remove => "remove",
            Phase::List => "list",
            Phase::CreateBucket => "create bucket",
        };
        f.write_str(s)
    }
}

/// Errors returned by the public object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// No metadata record exists for the path.
    #[error("object not found: {0:?}")]
    NotFound(String),

    /// The computed content hash differs from the caller supplied one.
    #[error("hash mismatch for {path:?}: expected {expected:?}, got {actual:?}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The byte count disagrees with the recorded or declared size.
    #[error("size mismatch for {path:?}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// Metadata references a hash whose blob is absent from the backend.
    #[error("metadata for {path:?} references missing blob {hash}")]
    MissingBlob { path: String, hash: String },

    /// The store has been told to stop.
    #[error("object store is dying")]
    Dying,

    /// The request was abandoned before a response was produced.
    #[error("request cancelled")]
    Cancelled,

    #[error("{phase} metadata for {path:?}: {source}")]
    Metadata {
        phase: Phase,
        path: String,
        #[source]
        source: MetadataError,
    },

    #[error("{phase} object {key:?}: {source}")]
    Session {
        phase: Phase,
        key: String,
        #[source]
        source: SessionError,
    },

    #[error("temporary file for {path:?}: {source}")]
    TempFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ObjectStoreError {
    /// Returns true for errors caused by cancellation or shutdown, which
    /// callers may choose to retry against another store instance.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ObjectStoreError::Dying | ObjectStoreError::Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound(_))
    }
}
