//! Metadata index: the mapping from logical path to content hash and size.

mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use sqlite::SqliteMetadata;

/// Metadata describing one stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Identifier assigned when the path was first written.
    pub uuid: Uuid,
    pub path: String,
    /// Hex SHA-384 of the content.
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata not found for path {0:?}")]
    NotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("corrupt metadata record for {path:?}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl MetadataError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, MetadataError::NotFound(_))
    }
}

/// Persistence contract for object metadata.
///
/// Every call is atomic on its own. `NotFound` is an expected outcome
/// distinguishing a path that was never written from a failure.
#[async_trait]
pub trait MetadataIndex: Send + Sync + std::fmt::Debug + 'static {
    async fn get_metadata(&self, path: &str) -> Result<Metadata, MetadataError>;

    /// Inserts or overwrites the record for `path`, returning its uuid.
    async fn put_metadata(&self, path: &str, hash: &str, size: u64)
        -> Result<Uuid, MetadataError>;

    async fn remove_metadata(&self, path: &str) -> Result<(), MetadataError>;

    async fn list_metadata(&self) -> Result<Vec<Metadata>, MetadataError>;

    /// Number of records whose content hash is `hash`.
    async fn hash_references(&self, hash: &str) -> Result<u64, MetadataError>;
}
