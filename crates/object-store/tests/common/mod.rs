//! Shared harness for object store integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cas_object_store::{
    BaseObjectStore, BlobClient, BlobReader, BlobSession, HashLocks, ObjectReader, ObjectStore,
    ObjectStoreClient, ObjectStoreConfig, SessionError, SqliteMetadata, DEFAULT_BUCKET,
};
use tokio::sync::{Notify, Semaphore};

pub const NAMESPACE: &str = "model";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A store on the local filesystem backend under `dir`.
pub async fn local_store(dir: &Path) -> ObjectStore {
    ObjectStore::open(ObjectStoreConfig::local(NAMESPACE, dir))
        .await
        .expect("failed to open local store")
}

/// Directory holding the blobs of a [`local_store`].
pub fn blob_dir(dir: &Path) -> PathBuf {
    dir.join("objects").join(DEFAULT_BUCKET).join(NAMESPACE)
}

pub fn blob_count(dir: &Path) -> usize {
    match std::fs::read_dir(blob_dir(dir)) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

pub fn temp_file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir.join("tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// A client whose uploads block until permits are released.
#[derive(Debug, Clone)]
pub struct GatedClient {
    inner: ObjectStoreClient,
    pub entered: Arc<Notify>,
    pub release: Arc<Semaphore>,
}

impl GatedClient {
    pub fn new() -> Self {
        Self {
            inner: ObjectStoreClient::memory(),
            entered: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }

    /// The backing client, bypassing the gate.
    pub fn ungated(&self) -> &ObjectStoreClient {
        &self.inner
    }

    /// Lets `n` blocked or future uploads through.
    pub fn open(&self, n: usize) {
        self.release.add_permits(n);
    }
}

#[async_trait]
impl BlobClient for GatedClient {
    async fn session(&self) -> Result<Box<dyn BlobSession>, SessionError> {
        Ok(Box::new(GatedSession {
            inner: self.inner.session().await?,
            entered: self.entered.clone(),
            release: self.release.clone(),
        }))
    }
}

struct GatedSession {
    inner: Box<dyn BlobSession>,
    entered: Arc<Notify>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl BlobSession for GatedSession {
    async fn create_bucket(&self, bucket: &str) -> Result<(), SessionError> {
        self.inner.create_bucket(bucket).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: BlobReader,
        integrity: &str,
    ) -> Result<(), SessionError> {
        self.entered.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .expect("gate semaphore closed");
        permit.forget();
        self.inner.put_object(bucket, key, data, integrity).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, SessionError> {
        self.inner.get_object(bucket, key).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), SessionError> {
        self.inner.delete_object(bucket, key).await
    }
}

/// A store whose uploads pass through `client`'s gate.
pub async fn gated_store(client: &GatedClient, temp_dir: &Path) -> ObjectStore {
    let metadata = SqliteMetadata::in_memory()
        .await
        .expect("failed to open metadata");
    let base = BaseObjectStore::new(
        NAMESPACE,
        DEFAULT_BUCKET,
        temp_dir,
        Arc::new(metadata),
        Arc::new(client.clone()),
        Arc::new(HashLocks::new()),
    )
    .expect("failed to build base store");
    ObjectStore::start(base, 16)
        .await
        .expect("failed to start store")
}
