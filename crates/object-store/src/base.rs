//! Core read, write and remove algorithms, independent of request sequencing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, warn};

use crate::claimer::{with_lock, Claimer};
use crate::error::{ObjectStoreError, Phase, Result};
use crate::hash::{ContentHashes, HashPolicy, HashingWriter};
use crate::metadata::{Metadata, MetadataError, MetadataIndex};
use crate::session::{BlobClient, BlobSession, ObjectReader, SessionError};

/// Composes the metadata index, blob client and hash locks.
#[derive(Debug, Clone)]
pub struct BaseObjectStore {
    namespace: String,
    bucket: String,
    temp_dir: PathBuf,
    metadata: Arc<dyn MetadataIndex>,
    client: Arc<dyn BlobClient>,
    claimer: Arc<dyn Claimer>,
}

fn metadata_error(phase: Phase, path: &str, err: MetadataError) -> ObjectStoreError {
    match err {
        MetadataError::NotFound(_) => ObjectStoreError::NotFound(path.to_string()),
        source => ObjectStoreError::Metadata {
            phase,
            path: path.to_string(),
            source,
        },
    }
}

fn session_error(phase: Phase, key: &str, source: SessionError) -> ObjectStoreError {
    ObjectStoreError::Session {
        phase,
        key: key.to_string(),
        source,
    }
}

impl BaseObjectStore {
    /// Creates the store, making sure `temp_dir` exists.
    pub fn new(
        namespace: impl Into<String>,
        bucket: impl Into<String>,
        temp_dir: impl AsRef<Path>,
        metadata: Arc<dyn MetadataIndex>,
        client: Arc<dyn BlobClient>,
        claimer: Arc<dyn Claimer>,
    ) -> Result<Self> {
        let temp_dir = temp_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&temp_dir).map_err(|source| ObjectStoreError::TempFile {
            path: temp_dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            namespace: namespace.into(),
            bucket: bucket.into(),
            temp_dir,
            metadata,
            client,
            claimer,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Backend key for a content hash.
    pub fn object_key(&self, hash: &str) -> String {
        format!("{}/{}", self.namespace, hash)
    }

    async fn session(&self, phase: Phase, key: &str) -> Result<Box<dyn BlobSession>> {
        self.client
            .session()
            .await
            .map_err(|source| session_error(phase, key, source))
    }

    /// Creates the bucket if it does not exist yet.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let session = self.session(Phase::CreateBucket, &self.bucket).await?;
        match session.create_bucket(&self.bucket).await {
            Ok(()) => {
                info!(bucket = %self.bucket, "created object store bucket");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(source) => Err(session_error(Phase::CreateBucket, &self.bucket, source)),
        }
    }

    /// Reads the committed object at `path`.
    pub async fn get(&self, path: &str) -> Result<ObjectReader> {
        debug!(path = %path, "getting object");

        let metadata = self
            .metadata
            .get_metadata(path)
            .await
            .map_err(|e| metadata_error(Phase::Get, path, e))?;

        let key = self.object_key(&metadata.hash);
        let session = self.session(Phase::Get, &key).await?;
        let reader = match session.get_object(&self.bucket, &key).await {
            Ok(reader) => reader,
            // Expected while an overwrite releases the old blob; the store
            // front decides whether it is a real divergence.
            Err(e) if e.is_not_found() => {
                debug!(path = %path, hash = %metadata.hash, "metadata references missing blob");
                return Err(ObjectStoreError::MissingBlob {
                    path: path.to_string(),
                    hash: metadata.hash,
                });
            }
            Err(source) => return Err(session_error(Phase::Get, &key, source)),
        };

        if reader.size() != metadata.size {
            error!(
                path = %path,
                hash = %metadata.hash,
                expected = metadata.size,
                actual = reader.size(),
                "object size disagrees with metadata"
            );
            return Err(ObjectStoreError::SizeMismatch {
                path: path.to_string(),
                expected: metadata.size,
                actual: reader.size(),
            });
        }

        Ok(reader)
    }

    /// Stores `size` bytes from `reader` at `path`.
    ///
    /// The input is spooled to a temp file while both digests are computed,
    /// and nothing is committed unless the size and hash policy hold.
    pub async fn put<R>(&self, path: &str, mut reader: R, size: u64, policy: HashPolicy) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        debug!(path = %path, size = size, "putting object");

        let temp_err = |source: std::io::Error| ObjectStoreError::TempFile {
            path: path.to_string(),
            source,
        };

        // Removed when dropped, on every exit path.
        let temp = tempfile::Builder::new()
            .prefix("put-")
            .tempfile_in(&self.temp_dir)
            .map_err(temp_err)?;
        let file = tokio::fs::File::from_std(temp.reopen().map_err(temp_err)?);

        let mut writer = HashingWriter::new(BufWriter::new(file));
        tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(temp_err)?;
        writer.flush().await.map_err(temp_err)?;
        let (file, hashes, written) = writer.finish();
        drop(file);

        if written != size {
            return Err(ObjectStoreError::SizeMismatch {
                path: path.to_string(),
                expected: size,
                actual: written,
            });
        }
        if let Err(expected) = policy.check(&hashes.file) {
            return Err(ObjectStoreError::HashMismatch {
                path: path.to_string(),
                expected,
                actual: hashes.file,
            });
        }

        let previous = match self.metadata.get_metadata(path).await {
            Ok(metadata) => Some(metadata.hash),
            Err(MetadataError::NotFound(_)) => None,
            Err(source) => {
                return Err(ObjectStoreError::Metadata {
                    phase: Phase::Put,
                    path: path.to_string(),
                    source,
                })
            }
        };

        with_lock(self.claimer.as_ref(), &hashes.file, || {
            self.commit(path, &temp, &hashes, size)
        })
        .await?;

        // The overwritten content may now be unreferenced. Its lock is taken
        // only after the new hash was released, so two puts swapping
        // contents cannot deadlock.
        if let Some(old) = previous.filter(|old| *old != hashes.file) {
            if let Err(e) = self.release_blob(&old).await {
                warn!(path = %path, hash = %old, error = %e, "failed to release overwritten blob");
            }
        }
        Ok(())
    }

    /// Streams the spooled blob up and records its metadata. Called with the
    /// hash held.
    async fn commit(
        &self,
        path: &str,
        temp: &NamedTempFile,
        hashes: &ContentHashes,
        size: u64,
    ) -> Result<()> {
        let file = temp.reopen().map_err(|source| ObjectStoreError::TempFile {
            path: path.to_string(),
            source,
        })?;
        let data = Box::new(BufReader::new(tokio::fs::File::from_std(file)));

        let key = self.object_key(&hashes.file);
        let session = self.session(Phase::Put, &key).await?;
        match session
            .put_object(&self.bucket, &key, data, &hashes.backend)
            .await
        {
            Ok(()) => info!(path = %path, hash = %hashes.file, size = size, "blob stored"),
            // Content addressed objects are immutable, so an existing
            // object already holds these bytes.
            Err(e) if e.is_already_exists() => {
                warn!(path = %path, hash = %hashes.file, "blob already present")
            }
            Err(source) => return Err(session_error(Phase::Put, &key, source)),
        }
        drop(session);

        // Metadata is written only once the blob is durable.
        self.metadata
            .put_metadata(path, &hashes.file, size)
            .await
            .map_err(|source| ObjectStoreError::Metadata {
                phase: Phase::Put,
                path: path.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Removes the object at `path`, deleting the blob once unreferenced.
    pub async fn remove(&self, path: &str) -> Result<()> {
        debug!(path = %path, "removing object");

        let metadata = self
            .metadata
            .get_metadata(path)
            .await
            .map_err(|e| metadata_error(Phase::Remove, path, e))?;
        let hash = metadata.hash;

        with_lock(self.claimer.as_ref(), &hash, || async {
            // Metadata goes before the blob. A crash in between leaves an
            // unreferenced blob behind.
            self.metadata
                .remove_metadata(path)
                .await
                .map_err(|e| metadata_error(Phase::Remove, path, e))?;
            self.delete_unreferenced(&hash).await
        })
        .await?;

        info!(path = %path, hash = %hash, "object removed");
        Ok(())
    }

    async fn release_blob(&self, hash: &str) -> Result<()> {
        with_lock(self.claimer.as_ref(), hash, || self.delete_unreferenced(hash)).await
    }

    /// Deletes the blob for `hash` unless a record still references it.
    /// Called with the hash held.
    async fn delete_unreferenced(&self, hash: &str) -> Result<()> {
        let references = self
            .metadata
            .hash_references(hash)
            .await
            .map_err(|source| ObjectStoreError::Metadata {
                phase: Phase::Remove,
                path: hash.to_string(),
                source,
            })?;
        if references > 0 {
            debug!(hash = %hash, references = references, "blob still referenced, keeping");
            return Ok(());
        }

        let key = self.object_key(hash);
        let session = self.session(Phase::Remove, &key).await?;
        match session.delete_object(&self.bucket, &key).await {
            Ok(()) => {
                debug!(hash = %hash, "blob deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(hash = %hash, "blob already absent");
                Ok(())
            }
            Err(source) => Err(session_error(Phase::Remove, &key, source)),
        }
    }

    pub async fn list(&self) -> Result<Vec<Metadata>> {
        self.metadata
            .list_metadata()
            .await
            .map_err(|source| ObjectStoreError::Metadata {
                phase: Phase::List,
                path: String::new(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claimer::HashLocks;
    use crate::hash::backend_digest;
    use crate::metadata::SqliteMetadata;
    use crate::session::ObjectStoreClient;

    struct Fixture {
        store: BaseObjectStore,
        client: ObjectStoreClient,
        locks: HashLocks,
        temp_dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreClient::memory();
        let locks = HashLocks::new();
        let metadata = SqliteMetadata::in_memory().await.unwrap();
        let store = BaseObjectStore::new(
            "model",
            "bucket",
            temp_dir.path(),
            Arc::new(metadata),
            Arc::new(client.clone()),
            Arc::new(locks.clone()),
        )
        .unwrap();
        store.ensure_bucket().await.unwrap();
        Fixture {
            store,
            client,
            locks,
            temp_dir,
        }
    }

    async fn put_bytes(store: &BaseObjectStore, path: &str, data: &[u8]) -> Result<()> {
        store
            .put(path, data, data.len() as u64, HashPolicy::AcceptAny)
            .await
    }

    async fn blob_exists(f: &Fixture, hash: &str) -> bool {
        let session = f.client.session().await.unwrap();
        session
            .get_object("bucket", &f.store.object_key(hash))
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let f = fixture().await;
        put_bytes(&f.store, "charms/a", b"hello world").await.unwrap();

        let reader = f.store.get("charms/a").await.unwrap();
        assert_eq!(reader.size(), 11);
        assert_eq!(reader.bytes().await.unwrap().as_ref(), b"hello world");
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let f = fixture().await;
        let err = f.store.get("never-written").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_hash_mismatch_commits_nothing() {
        let f = fixture().await;
        let err = f
            .store
            .put("p", &b"data"[..], 4, HashPolicy::MustEqual("0000".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::HashMismatch { .. }));

        assert!(f.store.get("p").await.unwrap_err().is_not_found());
        assert!(!blob_exists(&f, &ContentHashes::of(b"data").file).await);
        assert_eq!(std::fs::read_dir(f.temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_matching_hash_is_accepted() {
        let f = fixture().await;
        let hash = ContentHashes::of(b"data").file;
        f.store
            .put("p", &b"data"[..], 4, HashPolicy::MustEqual(hash.clone()))
            .await
            .unwrap();
        assert_eq!(f.store.list().await.unwrap()[0].hash, hash);
    }

    #[tokio::test]
    async fn test_declared_size_must_match_input() {
        let f = fixture().await;
        let err = f
            .store
            .put("p", &b"short"[..], 100, HashPolicy::AcceptAny)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ObjectStoreError::SizeMismatch {
                expected: 100,
                actual: 5,
                ..
            }
        ));
        assert!(f.store.list().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(f.temp_dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_shared_blob_survives_remove() {
        let f = fixture().await;
        put_bytes(&f.store, "a", b"shared").await.unwrap();
        put_bytes(&f.store, "b", b"shared").await.unwrap();

        let hash = ContentHashes::of(b"shared").file;
        let records = f.store.list().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|m| m.hash == hash));

        f.store.remove("a").await.unwrap();
        assert!(f.store.get("a").await.unwrap_err().is_not_found());
        let reader = f.store.get("b").await.unwrap();
        assert_eq!(reader.bytes().await.unwrap().as_ref(), b"shared");

        f.store.remove("b").await.unwrap();
        assert!(!blob_exists(&f, &hash).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_of_one_hash_all_succeed() {
        let f = fixture().await;
        let data: Arc<Vec<u8>> = Arc::new((0..200 * 1024).map(|i| (i % 241) as u8).collect());
        let hash = ContentHashes::of(&data).file;

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = f.store.clone();
            let data = data.clone();
            handles.push(tokio::spawn(async move {
                let size = data.len() as u64;
                let path = format!("resources/{i}");
                store
                    .put(&path, std::io::Cursor::new(data.to_vec()), size, HashPolicy::AcceptAny)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records = f.store.list().await.unwrap();
        assert_eq!(records.len(), 16);
        assert!(records.iter().all(|m| m.hash == hash));
        assert!(blob_exists(&f, &hash).await);
        assert!(f.locks.is_empty());

        for i in 0..16 {
            f.store.remove(&format!("resources/{i}")).await.unwrap();
            assert_eq!(blob_exists(&f, &hash).await, i < 15);
        }
        assert!(f.locks.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let f = fixture().await;
        assert!(f.store.remove("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_releases_old_blob() {
        let f = fixture().await;
        put_bytes(&f.store, "p", b"first").await.unwrap();
        put_bytes(&f.store, "p", b"second").await.unwrap();

        assert!(!blob_exists(&f, &ContentHashes::of(b"first").file).await);
        assert!(blob_exists(&f, &ContentHashes::of(b"second").file).await);
        let reader = f.store.get("p").await.unwrap();
        assert_eq!(reader.bytes().await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_size_divergence_is_reported() {
        let f = fixture().await;
        put_bytes(&f.store, "p", b"original").await.unwrap();

        // Replace the blob behind the index's back.
        let key = f.store.object_key(&ContentHashes::of(b"original").file);
        let session = f.client.session().await.unwrap();
        session.delete_object("bucket", &key).await.unwrap();
        session
            .put_object("bucket", &key, Box::new(&b"tampered!"[..]), &backend_digest(b"tampered!"))
            .await
            .unwrap();

        let err = f.store.get("p").await.unwrap_err();
        assert!(matches!(
            err,
            ObjectStoreError::SizeMismatch {
                expected: 8,
                actual: 9,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_blob_is_reported() {
        let f = fixture().await;
        put_bytes(&f.store, "p", b"gone").await.unwrap();

        let key = f.store.object_key(&ContentHashes::of(b"gone").file);
        let session = f.client.session().await.unwrap();
        session.delete_object("bucket", &key).await.unwrap();

        let err = f.store.get("p").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::MissingBlob { .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_ensure_bucket_is_idempotent() {
        let f = fixture().await;
        f.store.ensure_bucket().await.unwrap();
    }
}
