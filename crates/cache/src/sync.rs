//! Single-writer event application and the sync lifecycle.

use std::sync::Arc;

use mirador_core::{Event, Keyed, SyncState};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::Shared;

/// Stop control for a running sync task.
pub struct SyncHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop consuming events. In-flight queries complete against the last
    /// fully-applied state.
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Wait for the sync task to drain and exit (the source channel must be
    /// closed for this to return).
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub(crate) fn spawn<T>(shared: Arc<Shared<T>>, rx: mpsc::Receiver<Event<T>>) -> SyncHandle
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    let task = tokio::spawn(apply_loop(shared, rx));
    SyncHandle { task: Some(task) }
}

/// Applies events in delivery order, one write-lock acquisition per event so
/// readers observe each store+index delta together-or-not-at-all.
async fn apply_loop<T>(shared: Arc<Shared<T>>, mut rx: mpsc::Receiver<Event<T>>)
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    while let Some(ev) = rx.recv().await {
        match ev {
            Event::Added(obj) | Event::Updated(obj) => {
                let id = obj.identity();
                let mut state = shared.state.write().unwrap();
                let prev = state.store.put(id.clone(), obj.clone());
                state.indexes.reindex(&id, prev.as_ref(), Some(&obj));
                let count = state.store.len();
                drop(state);
                metrics::counter!("cache_events_total", 1u64, "kind" => "applied");
                metrics::gauge!("cache_objects", count as f64);
                debug!(id = %id, known = prev.is_some(), "applied object");
            }
            Event::Deleted(id) => {
                let mut state = shared.state.write().unwrap();
                let prev = state.store.delete(&id);
                state.indexes.reindex(&id, prev.as_ref(), None);
                let count = state.store.len();
                drop(state);
                metrics::counter!("cache_events_total", 1u64, "kind" => "deleted");
                metrics::gauge!("cache_objects", count as f64);
                if prev.is_none() {
                    debug!(id = %id, "delete for unknown identity ignored");
                } else {
                    debug!(id = %id, "deleted object");
                }
            }
            Event::InitialListDone => {
                let advanced = shared.sync_tx.send_if_modified(|s| {
                    if *s == SyncState::Syncing {
                        *s = SyncState::Synced;
                        true
                    } else {
                        false
                    }
                });
                if advanced {
                    let count = shared.state.read().unwrap().store.len();
                    info!(objects = count, "initial list delivered; cache synced");
                } else {
                    debug!("duplicate initial-list marker ignored");
                }
            }
        }
    }
    debug!("event channel closed; sync loop exiting");
}
