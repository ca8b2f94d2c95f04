//! Mirador cache: an in-memory, multi-index mirror of a remote object
//! collection.
//!
//! A single sync task consumes lifecycle events from an [`EventSource`] and
//! applies each one atomically to the object store and every registered
//! index; any number of readers query concurrently through the same handle.
//! Queries issued before the initial listing completes are legal and return
//! the partial mirror.

#![forbid(unsafe_code)]

mod index;
mod store;
mod sync;

pub use index::IndexTable;
pub use store::ObjectStore;
pub use sync::SyncHandle;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use mirador_core::{CacheError, EventSource, Identity, IndexFn, Keyed, SyncState};
use tokio::sync::watch;
use tracing::info;

/// Store and index table share one lock domain so a put/delete and its
/// reindex are never observed separately.
struct CacheState<T> {
    store: ObjectStore<T>,
    indexes: IndexTable<T>,
}

pub(crate) struct Shared<T> {
    pub(crate) state: RwLock<CacheState<T>>,
    pub(crate) sync_tx: watch::Sender<SyncState>,
}

/// Handle to one mirrored collection. Clones share the same underlying cache.
pub struct Cache<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T> Cache<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (sync_tx, _) = watch::channel(SyncState::NotStarted);
        let state = CacheState { store: ObjectStore::new(), indexes: IndexTable::new() };
        Self { shared: Arc::new(Shared { state: RwLock::new(state), sync_tx }) }
    }

    /// Register a named index. Valid only before [`start`](Self::start);
    /// objects ingested earlier would not be retroactively indexed.
    pub fn register_index<F>(&self, name: &str, func: F) -> Result<(), CacheError>
    where
        F: Fn(&T) -> Vec<String> + Send + Sync + 'static,
    {
        if self.sync_state() != SyncState::NotStarted {
            return Err(CacheError::AlreadyStarted);
        }
        let func: IndexFn<T> = Arc::new(func);
        self.shared.state.write().unwrap().indexes.register(name, func)
    }

    /// Begin consuming the source. Establishment failures surface here; after
    /// that, events are applied in delivery order until the returned handle
    /// is stopped or the source ends.
    pub async fn start(&self, source: impl EventSource<T>) -> Result<SyncHandle, CacheError> {
        if self.sync_state() != SyncState::NotStarted {
            return Err(CacheError::AlreadyStarted);
        }
        let rx = source.events().await?;
        let advanced = self.shared.sync_tx.send_if_modified(|s| {
            if *s == SyncState::NotStarted {
                *s = SyncState::Syncing;
                true
            } else {
                false
            }
        });
        if !advanced {
            return Err(CacheError::AlreadyStarted);
        }
        let indexes = self.shared.state.read().unwrap().indexes.len();
        info!(indexes, "sync started");
        Ok(sync::spawn(Arc::clone(&self.shared), rx))
    }

    pub fn sync_state(&self) -> SyncState {
        *self.shared.sync_tx.borrow()
    }

    /// Block until the initial listing has been delivered or `timeout`
    /// elapses. Returns `true` when synced, `false` on timeout.
    pub async fn wait_until_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.sync_tx.subscribe();
        let result = tokio::time::timeout(timeout, rx.wait_for(|s| *s == SyncState::Synced)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Current object for `id`, if any. Absence is a normal outcome, not an
    /// error.
    pub fn get(&self, id: &Identity) -> Option<T> {
        self.shared.state.read().unwrap().store.get(id)
    }

    /// Snapshot of all mirrored objects at call time; later mutations do not
    /// affect the returned vec.
    pub fn list(&self) -> Vec<T> {
        self.shared.state.read().unwrap().store.list()
    }

    /// Identities currently stored under `key` in index `name`.
    pub fn by_index(&self, name: &str, key: &str) -> Result<Vec<Identity>, CacheError> {
        self.shared.state.read().unwrap().indexes.lookup(name, key)
    }

    /// Objects currently stored under `key` in index `name`. An identity
    /// indexed but no longer stored is skipped.
    pub fn list_by_index(&self, name: &str, key: &str) -> Result<Vec<T>, CacheError> {
        let state = self.shared.state.read().unwrap();
        let ids = state.indexes.lookup(name, key)?;
        Ok(ids.iter().filter_map(|id| state.store.get(id)).collect())
    }

    /// All keys of index `name` with at least one member.
    pub fn index_keys(&self, name: &str) -> Result<Vec<String>, CacheError> {
        self.shared.state.read().unwrap().indexes.keys(name)
    }

    /// Number of mirrored objects.
    pub fn len(&self) -> usize {
        self.shared.state.read().unwrap().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.state.read().unwrap().store.is_empty()
    }
}

impl<T> Default for Cache<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
