//! Mirador kube integration: GVK resolution, watch sources, object shaping.
//!
//! Everything here is plumbing around the cache: it owns the wire protocol
//! (list+watch, reconnect, relist) and delivers shaped lifecycle events; the
//! cache never sees a network socket.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event as WatchEvent},
    Client,
};
use mirador_core::{Event, EventSource, Identity, Keyed, LiteObj, SourceError};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn queue_cap() -> usize {
    std::env::var("MIRADOR_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2048)
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Scalar at a dot-separated path, rendered as a string.
fn scalar_at(root: &serde_json::Value, path: &str) -> Option<String> {
    let mut cur = root;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    match cur {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Shape a raw object into the `LiteObj` the cache indexes over. Attributes
/// the object lacks are simply absent from the result.
fn shape(raw: &serde_json::Value, field_paths: &[String]) -> LiteObj {
    let meta = raw.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let namespace = meta
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let creation_ts = meta
        .and_then(|m| m.get("creationTimestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0);
    let mut labels = SmallVec::<[(String, String); 8]>::new();
    let mut annotations = SmallVec::<[(String, String); 4]>::new();
    if let Some(meta_obj) = meta.and_then(|m| m.as_object()) {
        if let Some(lbls) = meta_obj.get("labels").and_then(|m| m.as_object()) {
            for (k, v) in lbls.iter() {
                if let Some(val) = v.as_str() {
                    labels.push((k.clone(), val.to_string()));
                }
            }
        }
        if let Some(ann) = meta_obj.get("annotations").and_then(|m| m.as_object()) {
            for (k, v) in ann.iter() {
                if let Some(val) = v.as_str() {
                    annotations.push((k.clone(), val.to_string()));
                }
            }
        }
    }
    let mut fields = SmallVec::<[(String, String); 4]>::new();
    for path in field_paths {
        if let Some(val) = scalar_at(raw, path) {
            fields.push((path.clone(), val));
        }
    }
    LiteObj { namespace, name, creation_ts, labels, annotations, fields }
}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Watch source for one GVK, optionally namespace-scoped.
///
/// Wraps the kube watcher: classifies applied objects into added/updated from
/// a seen-identity set, emits the initial-list marker after the first list
/// page, and on a relist (reconnect) diffs against the seen set so the mirror
/// is retained and patched rather than cleared.
pub struct WatchSource {
    gvk_key: String,
    namespace: Option<String>,
    field_paths: Vec<String>,
}

impl WatchSource {
    pub fn new(gvk_key: impl Into<String>) -> Self {
        Self { gvk_key: gvk_key.into(), namespace: None, field_paths: Vec::new() }
    }

    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// JSON paths (e.g. `spec.nodeName`) projected into `LiteObj::fields` at
    /// shaping time.
    pub fn project_fields<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.field_paths = paths.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait::async_trait]
impl EventSource<LiteObj> for WatchSource {
    async fn events(self) -> Result<mpsc::Receiver<Event<LiteObj>>, SourceError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SourceError::new(e.to_string()))?;
        let gvk = parse_gvk_key(&self.gvk_key).map_err(|e| SourceError::new(e.to_string()))?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk)
            .await
            .map_err(|e| SourceError::new(e.to_string()))?;

        let api: Api<DynamicObject> = if namespaced {
            match self.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
                None => Api::all_with(client.clone(), &ar),
            }
        } else {
            Api::all_with(client.clone(), &ar)
        };

        let (tx, rx) = mpsc::channel(queue_cap());
        let gvk_key = self.gvk_key;
        let namespace = self.namespace;
        let field_paths = self.field_paths;
        tokio::spawn(async move {
            info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
            if let Err(e) = run_watch(api, field_paths, tx).await {
                warn!(gvk = %gvk_key, error = %e, "watch stream ended with error");
            } else {
                warn!(gvk = %gvk_key, "watch stream ended");
            }
        });
        Ok(rx)
    }
}

async fn run_watch(
    api: Api<DynamicObject>,
    field_paths: Vec<String>,
    tx: mpsc::Sender<Event<LiteObj>>,
) -> Result<()> {
    let cfg = watcher::Config::default();
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);

    let mut seen: FxHashSet<Identity> = FxHashSet::default();
    let mut listed = false;
    while let Some(ev) = stream.try_next().await? {
        match ev {
            WatchEvent::Applied(o) => {
                let lo = shape(&to_raw(&o)?, &field_paths);
                let id = lo.identity();
                let ev = if seen.insert(id) { Event::Added(lo) } else { Event::Updated(lo) };
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            WatchEvent::Deleted(o) => {
                let lo = shape(&to_raw(&o)?, &field_paths);
                let id = lo.identity();
                seen.remove(&id);
                if tx.send(Event::Deleted(id)).await.is_err() {
                    break;
                }
            }
            WatchEvent::Restarted(list) => {
                debug!(count = list.len(), relist = listed, "list page received");
                let mut present: FxHashSet<Identity> = FxHashSet::default();
                for o in list.iter() {
                    let lo = shape(&to_raw(o)?, &field_paths);
                    let id = lo.identity();
                    present.insert(id.clone());
                    let ev = if seen.insert(id) { Event::Added(lo) } else { Event::Updated(lo) };
                    if tx.send(ev).await.is_err() {
                        return Ok(());
                    }
                }
                // identities that vanished while the stream was down
                let gone: Vec<Identity> = seen.difference(&present).cloned().collect();
                for id in gone {
                    seen.remove(&id);
                    if tx.send(Event::Deleted(id)).await.is_err() {
                        return Ok(());
                    }
                }
                if !listed {
                    listed = true;
                    if tx.send(Event::InitialListDone).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Fans several member sources into one event channel, so a single sync
/// controller (and a single sync state) covers all of them.
///
/// The initial-list marker is forwarded once, after every member has
/// delivered its own; each member must emit it exactly once.
pub struct MultiplexSource<S> {
    members: Vec<S>,
}

impl<S> MultiplexSource<S> {
    pub fn new(members: Vec<S>) -> Self {
        Self { members }
    }
}

#[async_trait::async_trait]
impl<T, S> EventSource<T> for MultiplexSource<S>
where
    T: Send + 'static,
    S: EventSource<T>,
{
    async fn events(self) -> Result<mpsc::Receiver<Event<T>>, SourceError> {
        let (tx, rx) = mpsc::channel(queue_cap());
        let mut receivers = Vec::with_capacity(self.members.len());
        for member in self.members {
            receivers.push(member.events().await?);
        }
        if receivers.is_empty() {
            // nothing to list; vacuously synced
            let _ = tx.send(Event::InitialListDone).await;
            return Ok(rx);
        }
        let remaining = Arc::new(AtomicUsize::new(receivers.len()));
        for mut member_rx in receivers {
            let tx = tx.clone();
            let remaining = Arc::clone(&remaining);
            tokio::spawn(async move {
                while let Some(ev) = member_rx.recv().await {
                    match ev {
                        Event::InitialListDone => {
                            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                debug!("all member sources listed");
                                if tx.send(Event::InitialListDone).await.is_err() {
                                    break;
                                }
                            }
                        }
                        other => {
                            if tx.send(other).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        Ok(rx)
    }
}
