//! Blob session: scoped access to the backing object storage.
//!
//! Objects are addressed by `bucket` and a `key` of the form
//! `{namespace}/{hash}`. The [`ObjectStoreClient`] adapter maps buckets onto
//! top-level prefixes of an `object_store` backend (S3/MinIO, local
//! filesystem or memory).

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, Checksum};
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::hash::HashingWriter;

/// Marker written under each bucket by [`BlobSession::create_bucket`].
const BUCKET_MARKER: &str = ".bucket";

/// Uploads larger than this switch to multipart, in parts of this size.
pub const DEFAULT_UPLOAD_BUFFER: usize = 10 * 1024 * 1024;

pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Object content handed to [`BlobSession::put_object`].
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("integrity check failed for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("object storage error: {0}")]
    Backend(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, SessionError::AlreadyExists(_))
    }
}

/// Readable object content with its authoritative size.
///
/// The stream yields exactly `size` bytes when the backend is consistent.
pub struct ObjectReader {
    stream: ByteStream,
    size: u64,
}

impl ObjectReader {
    pub fn new(stream: ByteStream, size: u64) -> Self {
        Self { stream, size }
    }

    pub fn from_bytes(data: Bytes) -> Self {
        let size = data.len() as u64;
        Self::new(stream::once(async move { Ok(data) }).boxed(), size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }

    /// Reads the whole object, failing if the stream length disagrees
    /// with the reported size.
    pub async fn bytes(self) -> io::Result<Bytes> {
        let size = self.size;
        let mut buf = BytesMut::with_capacity(usize::try_from(size).unwrap_or(0));
        let mut stream = self.stream;
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > size {
                break;
            }
        }
        if buf.len() as u64 != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("object stream length {} differs from size {}", buf.len(), size),
            ));
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectReader")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Stream for ObjectReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// Hands out sessions against the backing storage.
#[async_trait]
pub trait BlobClient: Send + Sync + fmt::Debug + 'static {
    /// Opens a session. Callers hold it only for the duration of one
    /// critical section.
    async fn session(&self) -> Result<Box<dyn BlobSession>, SessionError>;
}

/// Operations available within one session.
#[async_trait]
pub trait BlobSession: Send + Sync {
    /// Creates the bucket. Returns `AlreadyExists` if it is already there.
    async fn create_bucket(&self, bucket: &str) -> Result<(), SessionError>;

    /// Streams `data` to `key`, rejecting it if its base64 SHA-256
    /// differs from `integrity`. Returns `AlreadyExists` if the key is taken.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: BlobReader,
        integrity: &str,
    ) -> Result<(), SessionError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, SessionError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), SessionError>;
}

/// [`BlobClient`] over any `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    kind: &'static str,
    upload_buffer: usize,
}

impl fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreClient")
            .field("kind", &self.kind)
            .field("upload_buffer", &self.upload_buffer)
            .finish()
    }
}

impl ObjectStoreClient {
    pub fn new(config: &BackendConfig) -> Result<Self, SessionError> {
        match config {
            BackendConfig::Memory => Ok(Self::memory()),
            BackendConfig::Local { path } => Self::local(path.clone()),
            BackendConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let store = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(true)
                    .with_checksum_algorithm(Checksum::SHA256)
                    .build()?;
                info!(endpoint = %endpoint, bucket = %bucket, "using S3 object storage");
                Ok(Self::with_store(Arc::new(store), "s3"))
            }
        }
    }

    pub fn memory() -> Self {
        Self::with_store(Arc::new(InMemory::new()), "memory")
    }

    pub fn local(path: PathBuf) -> Result<Self, SessionError> {
        std::fs::create_dir_all(&path)?;
        let store = LocalFileSystem::new_with_prefix(&path)?;
        info!(path = %path.display(), "using local object storage");
        Ok(Self::with_store(Arc::new(store), "local"))
    }

    fn with_store(store: Arc<dyn ObjectStore>, kind: &'static str) -> Self {
        Self {
            store,
            kind,
            upload_buffer: DEFAULT_UPLOAD_BUFFER,
        }
    }

    /// Sets the in-memory upload buffer, which is also the multipart part
    /// size. S3 requires parts of at least 5 MiB.
    pub fn with_upload_buffer(mut self, bytes: usize) -> Self {
        self.upload_buffer = bytes.max(1);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

#[async_trait]
impl BlobClient for ObjectStoreClient {
    async fn session(&self) -> Result<Box<dyn BlobSession>, SessionError> {
        Ok(Box::new(ObjectStoreSession {
            store: self.store.clone(),
            upload_buffer: self.upload_buffer,
        }))
    }
}

struct ObjectStoreSession {
    store: Arc<dyn ObjectStore>,
    upload_buffer: usize,
}

fn location(bucket: &str, key: &str) -> ObjectPath {
    ObjectPath::from(format!("{bucket}/{key}"))
}

fn map_backend_error(err: object_store::Error, key: &str) -> SessionError {
    match err {
        object_store::Error::NotFound { .. } => SessionError::NotFound(key.to_string()),
        object_store::Error::AlreadyExists { .. } => SessionError::AlreadyExists(key.to_string()),
        other => SessionError::Backend(other),
    }
}

async fn abort(upload: &mut BufWriter, key: &str) {
    if let Err(e) = upload.abort().await {
        warn!(key = %key, error = %e, "failed to abort upload");
    }
}

impl ObjectStoreSession {
    async fn exists(&self, location: &ObjectPath, key: &str) -> Result<bool, SessionError> {
        match self.store.head(location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(map_backend_error(e, key)),
        }
    }
}

#[async_trait]
impl BlobSession for ObjectStoreSession {
    async fn create_bucket(&self, bucket: &str) -> Result<(), SessionError> {
        let marker = location(bucket, BUCKET_MARKER);
        if self.exists(&marker, bucket).await? {
            return Err(SessionError::AlreadyExists(bucket.to_string()));
        }
        self.store
            .put(&marker, PutPayload::new())
            .await
            .map_err(|e| map_backend_error(e, bucket))?;
        debug!(bucket = %bucket, "bucket created");
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut data: BlobReader,
        integrity: &str,
    ) -> Result<(), SessionError> {
        let location = location(bucket, key);
        if self.exists(&location, key).await? {
            return Err(SessionError::AlreadyExists(key.to_string()));
        }

        // Small objects go up in a single put on shutdown, larger ones as a
        // multipart upload. Nothing is visible until shutdown completes.
        let upload = BufWriter::with_capacity(self.store.clone(), location, self.upload_buffer);
        let mut writer = HashingWriter::new(upload);
        let copied = tokio::io::copy(&mut data, &mut writer).await;
        let (mut upload, hashes, size) = writer.finish();

        if let Err(e) = copied {
            abort(&mut upload, key).await;
            return Err(SessionError::Io(e));
        }
        if hashes.backend != integrity {
            abort(&mut upload, key).await;
            return Err(SessionError::IntegrityMismatch {
                key: key.to_string(),
                expected: integrity.to_string(),
                actual: hashes.backend,
            });
        }

        upload.shutdown().await?;
        debug!(key = %key, size = size, "object uploaded");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectReader, SessionError> {
        let result = self
            .store
            .get(&location(bucket, key))
            .await
            .map_err(|e| map_backend_error(e, key))?;
        let size = result.meta.size as u64;
        let stream = result.into_stream().map_err(io::Error::other).boxed();
        Ok(ObjectReader::new(stream, size))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), SessionError> {
        self.store
            .delete(&location(bucket, key))
            .await
            .map_err(|e| map_backend_error(e, key))
    }
}
