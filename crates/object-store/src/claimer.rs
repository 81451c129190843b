//! Hash-keyed lock table.
//!
//! A claim on a content hash grants the exclusive right to write or delete
//! the blob stored under that hash. Claims on different hashes never
//! contend with each other.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Grants exclusive holds keyed by content hash.
#[async_trait]
pub trait Claimer: Send + Sync + fmt::Debug + 'static {
    /// Waits until the hold on `hash` is available and takes it.
    ///
    /// The hold is released when the returned [`Claim`] is dropped. Dropping
    /// the future while it waits leaves no hold behind.
    async fn claim(&self, hash: &str) -> Claim;
}

/// An exclusive hold on a hash, released on drop.
pub struct Claim {
    hash: String,
    _release: Box<dyn Send + Sync>,
}

impl Claim {
    pub fn new(hash: impl Into<String>, release: impl Send + Sync + 'static) -> Self {
        Self {
            hash: hash.into(),
            _release: Box::new(release),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim").field("hash", &self.hash).finish()
    }
}

/// Runs `f` while holding the claim on `hash`.
///
/// The claim is released however `f` finishes, including when the
/// returned future is dropped part way through.
pub async fn with_lock<C, F, Fut, T>(claimer: &C, hash: &str, f: F) -> T
where
    C: Claimer + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let _claim = claimer.claim(hash).await;
    f().await
}

#[derive(Debug)]
struct LockEntry {
    lock: Arc<tokio::sync::Mutex<()>>,
    holders: usize,
}

type LockTable = Arc<Mutex<HashMap<String, LockEntry>>>;

/// In-process [`Claimer`] backed by one async mutex per live hash.
///
/// Entries are reference counted by waiters and holders and removed once
/// the last of them goes away, so the table only tracks hashes in use.
#[derive(Debug, Clone, Default)]
pub struct HashLocks {
    table: LockTable,
}

impl HashLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hashes currently held or waited on.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn lock(&self, hash: &str) -> Claim {
        let lock = {
            let mut table = self.table.lock();
            let entry = table.entry(hash.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::default(),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };
        // Created before the first await so a cancelled wait still
        // decrements the holder count.
        let registration = Registration {
            table: self.table.clone(),
            hash: hash.to_string(),
        };
        let guard = lock.lock_owned().await;
        Claim::new(
            hash,
            HashClaim {
                _guard: guard,
                _registration: registration,
            },
        )
    }
}

#[async_trait]
impl Claimer for HashLocks {
    async fn claim(&self, hash: &str) -> Claim {
        self.lock(hash).await
    }
}

// Field order matters: the mutex guard is released before the
// registration drops the table entry.
struct HashClaim {
    _guard: OwnedMutexGuard<()>,
    _registration: Registration,
}

struct Registration {
    table: LockTable,
    hash: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&self.hash) {
            entry.holders -= 1;
            if entry.holders == 0 {
                table.remove(&self.hash);
            }
        }
    }
}
