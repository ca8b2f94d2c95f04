#![forbid(unsafe_code)]

use std::time::Duration;

use mirador_cache::Cache;
use mirador_core::{CacheError, ChannelSource, Event, LiteObj, SyncState};
use tokio::sync::mpsc;

fn obj(ns: &str, name: &str) -> LiteObj {
    LiteObj {
        namespace: Some(ns.to_string()),
        name: name.to_string(),
        creation_ts: 0,
        labels: Default::default(),
        annotations: Default::default(),
        fields: Default::default(),
    }
}

/// Poll until the mirror holds `n` objects; events are applied by a separate
/// task, so tests that assert mid-sync state need a bounded wait.
async fn settle_to_len(cache: &Cache<LiteObj>, n: usize) {
    for _ in 0..100 {
        if cache.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache never reached {} objects (at {})", n, cache.len());
}

#[tokio::test]
async fn wait_times_out_before_the_marker() {
    let cache: Cache<LiteObj> = Cache::new();
    assert_eq!(cache.sync_state(), SyncState::NotStarted);

    let (tx, rx) = mpsc::channel(16);
    let handle = cache.start(ChannelSource(rx)).await.unwrap();
    assert_eq!(cache.sync_state(), SyncState::Syncing);

    assert!(!cache.wait_until_synced(Duration::from_millis(100)).await);
    assert_eq!(cache.sync_state(), SyncState::Syncing);

    drop(tx);
    handle.join().await;
}

#[tokio::test]
async fn wait_returns_promptly_after_the_marker() {
    let cache: Cache<LiteObj> = Cache::new();
    let (tx, rx) = mpsc::channel(16);
    let _handle = cache.start(ChannelSource(rx)).await.unwrap();

    tx.send(Event::Added(obj("ns", "a"))).await.unwrap();
    tx.send(Event::InitialListDone).await.unwrap();

    assert!(cache.wait_until_synced(Duration::from_secs(5)).await);
    assert_eq!(cache.sync_state(), SyncState::Synced);
    // the marker is ordered behind the add, so the add is already visible
    assert_eq!(cache.len(), 1);
    // waiting again returns immediately once synced
    assert!(cache.wait_until_synced(Duration::from_millis(1)).await);
}

#[tokio::test]
async fn queries_during_initial_sync_see_the_partial_mirror() {
    let cache: Cache<LiteObj> = Cache::new();
    let (tx, rx) = mpsc::channel(16);
    let _handle = cache.start(ChannelSource(rx)).await.unwrap();

    tx.send(Event::Added(obj("ns", "a"))).await.unwrap();
    settle_to_len(&cache, 1).await;

    assert_eq!(cache.sync_state(), SyncState::Syncing);
    let listed = cache.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "a");

    tx.send(Event::Added(obj("ns", "b"))).await.unwrap();
    tx.send(Event::InitialListDone).await.unwrap();
    assert!(cache.wait_until_synced(Duration::from_secs(5)).await);
    // the pre-sync view was a subset of the post-sync one
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn registration_after_start_is_rejected() {
    let cache: Cache<LiteObj> = Cache::new();
    cache.register_index("byLabel", |_: &LiteObj| Vec::new()).unwrap();

    let (_tx, rx) = mpsc::channel::<Event<LiteObj>>(1);
    let _handle = cache.start(ChannelSource(rx)).await.unwrap();

    let res = cache.register_index("late", |_: &LiteObj| Vec::new());
    assert!(matches!(res, Err(CacheError::AlreadyStarted)));
}

#[tokio::test]
async fn duplicate_index_name_fails_fast() {
    let cache: Cache<LiteObj> = Cache::new();
    cache.register_index("byLabel", |_: &LiteObj| Vec::new()).unwrap();
    let res = cache.register_index("byLabel", |_: &LiteObj| Vec::new());
    assert!(matches!(res, Err(CacheError::DuplicateIndex(_))));
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let cache: Cache<LiteObj> = Cache::new();
    let (_tx, rx) = mpsc::channel::<Event<LiteObj>>(1);
    let _handle = cache.start(ChannelSource(rx)).await.unwrap();

    let (_tx2, rx2) = mpsc::channel::<Event<LiteObj>>(1);
    let res = cache.start(ChannelSource(rx2)).await;
    assert!(matches!(res, Err(CacheError::AlreadyStarted)));
}

#[tokio::test]
async fn stop_keeps_the_last_applied_state_readable() {
    let cache: Cache<LiteObj> = Cache::new();
    let (tx, rx) = mpsc::channel(16);
    let handle = cache.start(ChannelSource(rx)).await.unwrap();

    tx.send(Event::Added(obj("ns", "a"))).await.unwrap();
    tx.send(Event::InitialListDone).await.unwrap();
    assert!(cache.wait_until_synced(Duration::from_secs(5)).await);

    handle.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // events after stop are not consumed
    let _ = tx.send(Event::Added(obj("ns", "b"))).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.len(), 1);
    let found = cache.get(&mirador_core::Identity::namespaced("ns", "a"));
    assert_eq!(found.map(|o| o.name), Some("a".to_string()));
}

#[tokio::test]
async fn marker_is_one_way_even_if_repeated() {
    let cache: Cache<LiteObj> = Cache::new();
    let (tx, rx) = mpsc::channel(16);
    let handle = cache.start(ChannelSource(rx)).await.unwrap();

    tx.send(Event::InitialListDone).await.unwrap();
    tx.send(Event::InitialListDone).await.unwrap();
    tx.send(Event::Added(obj("ns", "a"))).await.unwrap();
    drop(tx);
    handle.join().await;

    assert_eq!(cache.sync_state(), SyncState::Synced);
    assert_eq!(cache.len(), 1);
}
