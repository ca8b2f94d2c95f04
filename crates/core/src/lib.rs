//! Mirador core types: object identity, lifecycle events, sync state.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::mpsc;

/// Stable unique key of a mirrored object: namespace + name.
///
/// Identity never changes for the life of an object; content does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub namespace: Option<String>,
    pub name: String,
}

impl Identity {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: None, name: name.into() }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Payloads mirrored by a cache expose their identity through this trait.
pub trait Keyed {
    fn identity(&self) -> Identity;
}

/// Lifecycle event delivered by an event source.
///
/// Deletes carry only the identity; the cache supplies the last stored value
/// when computing index deltas.
#[derive(Debug, Clone)]
pub enum Event<T> {
    /// First sighting of an identity.
    Added(T),
    /// Replacement content for a known identity.
    Updated(T),
    /// The identity no longer exists at the source.
    Deleted(Identity),
    /// One-time marker: the initial bulk listing has been delivered.
    InitialListDone,
}

/// Cache synchronization lifecycle. Transitions are one-directional:
/// `NotStarted -> Syncing -> Synced`, and `Synced` never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    NotStarted,
    Syncing,
    Synced,
}

/// Derives zero or more index keys from one object.
///
/// Must be pure and total: no external state, no input mutation, and a
/// missing attribute yields an empty vec rather than an error. Duplicate keys
/// within one return are collapsed by the index.
pub type IndexFn<T> = Arc<dyn Fn(&T) -> Vec<String> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("duplicate index: {0}")]
    DuplicateIndex(String),
    #[error("cache already started")]
    AlreadyStarted,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// The event stream could not be established or was lost.
#[derive(Debug, thiserror::Error)]
#[error("source unavailable: {0}")]
pub struct SourceError(String);

impl SourceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// External collaborator owning the wire protocol.
///
/// `events` establishes the stream and hands back the receiving end.
/// Establishment failures surface here; once the receiver is returned,
/// delivery runs until the sender side is dropped or the consumer stops.
/// Events for one identity must be delivered in the order they occurred.
#[async_trait::async_trait]
pub trait EventSource<T>: Send + 'static {
    async fn events(self) -> Result<mpsc::Receiver<Event<T>>, SourceError>;
}

/// Event source over a pre-established channel. Useful when the stream is
/// produced elsewhere (fan-in adapters, tests).
pub struct ChannelSource<T>(pub mpsc::Receiver<Event<T>>);

#[async_trait::async_trait]
impl<T: Send + 'static> EventSource<T> for ChannelSource<T> {
    async fn events(self) -> Result<mpsc::Receiver<Event<T>>, SourceError> {
        Ok(self.0)
    }
}

/// Shaped view of a cluster object: identity plus the string attributes
/// indexes are derived from. Producing one from a raw payload is the source
/// adapter's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteObj {
    pub namespace: Option<String>,
    pub name: String,
    pub creation_ts: i64,
    /// Labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Annotations as key/value pairs.
    pub annotations: SmallVec<[(String, String); 4]>,
    /// Scalar fields projected at shaping time, keyed by JSON path.
    pub fields: SmallVec<[(String, String); 4]>,
}

impl LiteObj {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn field(&self, path: &str) -> Option<&str> {
        self.fields.iter().find(|(p, _)| p == path).map(|(_, v)| v.as_str())
    }
}

impl Keyed for LiteObj {
    fn identity(&self) -> Identity {
        Identity { namespace: self.namespace.clone(), name: self.name.clone() }
    }
}

pub mod prelude {
    pub use super::{
        CacheError, ChannelSource, Event, EventSource, Identity, IndexFn, Keyed, LiteObj,
        SourceError, SyncState,
    };
}
