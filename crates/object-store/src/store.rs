//! Sequenced object store front.
//!
//! Puts and removes for a store instance are funnelled through a single
//! consumer loop so they apply in submission order. Gets first try an
//! optimistic read of committed metadata and only join the queue on a miss.
//! Shutdown is broadcast through the store state and raced against every
//! wait point, so pending callers return promptly with
//! [`ObjectStoreError::Dying`].

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use crate::base::BaseObjectStore;
use crate::claimer::HashLocks;
use crate::config::ObjectStoreConfig;
use crate::error::{ObjectStoreError, Phase, Result};
use crate::hash::HashPolicy;
use crate::metadata::{Metadata, SqliteMetadata};
use crate::session::{ObjectReader, ObjectStoreClient};

/// Reader type accepted by puts, boxed so it can travel to the loop task.
pub type PutReader = Box<dyn AsyncRead + Send + Unpin>;

/// Lifecycle of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Ensuring the bucket exists.
    Starting,
    /// The request loop is consuming requests.
    Running,
    /// Shutdown was signalled; no new requests are accepted.
    Dying,
    Stopped,
}

impl StoreState {
    pub fn is_dying(&self) -> bool {
        matches!(self, StoreState::Dying | StoreState::Stopped)
    }
}

enum Request {
    Get {
        path: String,
        response: oneshot::Sender<Result<ObjectReader>>,
    },
    Put {
        path: String,
        reader: PutReader,
        size: u64,
        policy: HashPolicy,
        response: oneshot::Sender<Result<()>>,
    },
    Remove {
        path: String,
        response: oneshot::Sender<Result<()>>,
    },
}

impl Request {
    fn reject(self, err: ObjectStoreError) {
        // The requester may already be gone.
        match self {
            Request::Get { response, .. } => {
                let _ = response.send(Err(err));
            }
            Request::Put { response, .. } | Request::Remove { response, .. } => {
                let _ = response.send(Err(err));
            }
        }
    }
}

/// Resolves once the store is dying or stopped.
async fn dying(state: &mut watch::Receiver<StoreState>) {
    // An error means every sender is gone, which only happens once the
    // store itself is gone.
    let _ = state.wait_for(StoreState::is_dying).await;
}

/// Object store handle. Cheap to clone; all clones share one request loop.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    base: BaseObjectStore,
    requests: mpsc::Sender<Request>,
    state: Arc<watch::Sender<StoreState>>,
}

impl ObjectStore {
    /// Opens a store from configuration: SQLite metadata, the configured
    /// backend and an in-process hash lock table.
    pub async fn open(config: ObjectStoreConfig) -> Result<Self> {
        config.validate()?;

        let metadata = match &config.metadata_db {
            Some(path) => SqliteMetadata::new(path).await,
            None => SqliteMetadata::in_memory().await,
        }
        .map_err(|source| ObjectStoreError::Metadata {
            phase: Phase::Open,
            path: String::new(),
            source,
        })?;
        let client = ObjectStoreClient::new(&config.backend).map_err(|source| {
            ObjectStoreError::Session {
                phase: Phase::Open,
                key: config.bucket.clone(),
                source,
            }
        })?;
        let temp_dir = config
            .temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cas-object-store"));

        let base = BaseObjectStore::new(
            config.namespace.clone(),
            config.bucket.clone(),
            temp_dir,
            Arc::new(metadata),
            Arc::new(client),
            Arc::new(HashLocks::new()),
        )?;
        Self::start(base, config.request_buffer).await
    }

    /// Fully ephemeral store (in-memory metadata and objects).
    pub async fn ephemeral(namespace: impl Into<String>) -> Result<Self> {
        Self::open(ObjectStoreConfig::ephemeral(namespace)).await
    }

    /// Ensures the bucket exists and spawns the request loop.
    pub async fn start(base: BaseObjectStore, request_buffer: usize) -> Result<Self> {
        let state = Arc::new(watch::Sender::new(StoreState::Starting));

        if let Err(e) = base.ensure_bucket().await {
            state.send_replace(StoreState::Stopped);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(request_buffer.max(1));
        let request_loop = RequestLoop {
            base: base.clone(),
            requests: rx,
            state: state.clone(),
            state_rx: state.subscribe(),
        };
        state.send_replace(StoreState::Running);
        tokio::spawn(request_loop.run());

        info!(namespace = %base.namespace(), bucket = %base.bucket(), "object store started");
        Ok(Self {
            inner: Arc::new(Inner {
                base,
                requests: tx,
                state,
            }),
        })
    }

    pub fn namespace(&self) -> &str {
        self.inner.base.namespace()
    }

    pub fn state(&self) -> StoreState {
        *self.inner.state.borrow()
    }

    /// Returns a reader for the object at `path` along with its size.
    pub async fn get(&self, path: &str) -> Result<ObjectReader> {
        let mut state = self.accepting()?;

        // Safe outside the loop: the base store only reads committed
        // metadata, so this sees either the old or the new object.
        let optimistic = tokio::select! {
            biased;
            _ = dying(&mut state) => return Err(ObjectStoreError::Dying),
            result = self.inner.base.get(path) => result,
        };
        match optimistic {
            Err(e @ (ObjectStoreError::NotFound(_) | ObjectStoreError::MissingBlob { .. })) => {
                debug!(path = %path, error = %e, "optimistic get missed, sequencing")
            }
            result => return result,
        }

        let (tx, rx) = oneshot::channel();
        let request = Request::Get {
            path: path.to_string(),
            response: tx,
        };
        let result = self.submit(&mut state, request, rx).await;
        // No put or remove runs concurrently with a sequenced get, so a
        // missing blob here means the index and backend disagree.
        if let Err(ObjectStoreError::MissingBlob { path, hash }) = &result {
            error!(path = %path, hash = %hash, "metadata references missing blob");
        }
        result
    }

    /// Stores `size` bytes read from `reader` at `path`.
    pub async fn put<R>(&self, path: &str, reader: R, size: u64) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.put_with_policy(path, Box::new(reader), size, HashPolicy::AcceptAny)
            .await
    }

    /// Like [`put`](Self::put), but fails with
    /// [`ObjectStoreError::HashMismatch`] unless the content's hex SHA-384
    /// equals `hash`. Nothing is stored on mismatch.
    pub async fn put_and_check_hash<R>(
        &self,
        path: &str,
        reader: R,
        size: u64,
        hash: &str,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.put_with_policy(
            path,
            Box::new(reader),
            size,
            HashPolicy::MustEqual(hash.to_string()),
        )
        .await
    }

    async fn put_with_policy(
        &self,
        path: &str,
        reader: PutReader,
        size: u64,
        policy: HashPolicy,
    ) -> Result<()> {
        let mut state = self.accepting()?;
        let (tx, rx) = oneshot::channel();
        let request = Request::Put {
            path: path.to_string(),
            reader,
            size,
            policy,
            response: tx,
        };
        self.submit(&mut state, request, rx).await
    }

    /// Removes the object at `path`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.accepting()?;
        let (tx, rx) = oneshot::channel();
        let request = Request::Remove {
            path: path.to_string(),
            response: tx,
        };
        self.submit(&mut state, request, rx).await
    }

    /// Lists metadata for every stored path.
    pub async fn list(&self) -> Result<Vec<Metadata>> {
        self.accepting()?;
        self.inner.base.list().await
    }

    /// Signals the store to stop. Pending and future calls fail with `Dying`.
    pub fn kill(&self) {
        let signalled = self.inner.state.send_if_modified(|state| {
            if state.is_dying() {
                return false;
            }
            *state = StoreState::Dying;
            true
        });
        if signalled {
            info!(namespace = %self.namespace(), "object store dying");
        }
    }

    /// Waits until the request loop has stopped.
    pub async fn wait(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == StoreState::Stopped).await;
    }

    fn accepting(&self) -> Result<watch::Receiver<StoreState>> {
        let state = self.inner.state.subscribe();
        if state.borrow().is_dying() {
            return Err(ObjectStoreError::Dying);
        }
        Ok(state)
    }

    async fn submit<T>(
        &self,
        state: &mut watch::Receiver<StoreState>,
        request: Request,
        response: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = dying(state) => return Err(ObjectStoreError::Dying),
            sent = self.inner.requests.send(request) => {
                if sent.is_err() {
                    return Err(ObjectStoreError::Dying);
                }
            }
        }

        tokio::select! {
            biased;
            response = response => response.unwrap_or(Err(ObjectStoreError::Cancelled)),
            _ = dying(state) => Err(ObjectStoreError::Dying),
        }
    }
}

/// The single consumer servicing queued requests one at a time.
struct RequestLoop {
    base: BaseObjectStore,
    requests: mpsc::Receiver<Request>,
    state: Arc<watch::Sender<StoreState>>,
    state_rx: watch::Receiver<StoreState>,
}

impl RequestLoop {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                biased;
                _ = dying(&mut self.state_rx) => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    // Every handle was dropped.
                    None => break,
                },
            };
            if self.handle(request).await.is_break() {
                break;
            }
        }

        self.state.send_if_modified(|state| {
            if state.is_dying() {
                return false;
            }
            *state = StoreState::Dying;
            true
        });

        self.requests.close();
        let mut rejected = 0usize;
        while let Some(request) = self.requests.recv().await {
            request.reject(ObjectStoreError::Dying);
            rejected += 1;
        }

        self.state.send_replace(StoreState::Stopped);
        info!(
            namespace = %self.base.namespace(),
            rejected = rejected,
            "object store stopped"
        );
    }

    async fn handle(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::Get { path, response } => {
                serve(&mut self.state_rx, response, self.base.get(&path)).await
            }
            Request::Put {
                path,
                reader,
                size,
                policy,
                response,
            } => {
                serve(
                    &mut self.state_rx,
                    response,
                    self.base.put(&path, reader, size, policy),
                )
                .await
            }
            Request::Remove { path, response } => {
                serve(&mut self.state_rx, response, self.base.remove(&path)).await
            }
        }
    }
}

/// Runs `op` unless the store starts dying or the requester goes away
/// first, delivering the result.
async fn serve<T, F>(
    state: &mut watch::Receiver<StoreState>,
    mut response: oneshot::Sender<Result<T>>,
    op: F,
) -> ControlFlow<()>
where
    F: Future<Output = Result<T>>,
{
    if response.is_closed() {
        debug!("requester went away, skipping request");
        return ControlFlow::Continue(());
    }

    tokio::select! {
        biased;
        _ = dying(state) => {
            let _ = response.send(Err(ObjectStoreError::Dying));
            ControlFlow::Break(())
        }
        _ = response.closed() => {
            debug!("requester went away, abandoning request");
            ControlFlow::Continue(())
        }
        result = op => {
            if response.send(result).is_err() {
                debug!("requester went away before the response");
            }
            ControlFlow::Continue(())
        }
    }
}
