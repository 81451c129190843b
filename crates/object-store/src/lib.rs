//! Content-addressed object store with SQLite metadata and sequenced access.
//!
//! Objects are stored once per content hash (hex SHA-384) in a backing
//! object storage bucket, under `{namespace}/{hash}`. A metadata index maps
//! caller-chosen paths onto hashes, so several paths can share one blob.
//!
//! # Guarantees
//!
//! - Readers only ever see committed metadata, and a blob is durable before
//!   any metadata references it.
//! - Puts and removes on one store are applied in submission order.
//! - A blob is never deleted while a path still references its hash; writes
//!   and deletes of one hash are serialized by a hash lock table, while
//!   distinct hashes proceed in parallel.
//!
//! # Example
//!
//! ```rust,no_run
//! use cas_object_store::ObjectStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ObjectStore::ephemeral("model-a").await?;
//!
//! store.put("charms/mysql", &b"charm bytes"[..], 11).await?;
//!
//! let reader = store.get("charms/mysql").await?;
//! assert_eq!(reader.size(), 11);
//! let data = reader.bytes().await?;
//! assert_eq!(data.as_ref(), b"charm bytes");
//!
//! store.remove("charms/mysql").await?;
//! store.kill();
//! store.wait().await;
//! # Ok(())
//! # }
//! ```

mod base;
mod claimer;
mod config;
mod error;
mod hash;
mod metadata;
mod session;
mod store;

pub use base::BaseObjectStore;
pub use claimer::{with_lock, Claim, Claimer, HashLocks};
pub use config::{BackendConfig, ObjectStoreConfig, DEFAULT_BUCKET, DEFAULT_REQUEST_BUFFER};
pub use error::{ObjectStoreError, Phase, Result};
pub use hash::{backend_digest, ContentHashes, HashPolicy, HashingWriter};
pub use metadata::{Metadata, MetadataError, MetadataIndex, SqliteMetadata};
pub use session::{
    BlobClient, BlobReader, BlobSession, ByteStream, ObjectReader, ObjectStoreClient,
    SessionError, DEFAULT_UPLOAD_BUFFER,
};
pub use store::{ObjectStore, PutReader, StoreState};
