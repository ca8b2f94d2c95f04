#![forbid(unsafe_code)]

use std::time::Duration;

use mirador_cache::Cache;
use mirador_core::{ChannelSource, Event, EventSource, LiteObj};
use mirador_kubehub::MultiplexSource;
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

async fn recv(rx: &mut mpsc::Receiver<Event<LiteObj>>) -> Event<LiteObj> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("stream closed early")
}

#[tokio::test]
async fn marker_forwarded_once_after_all_members_list() {
    let (tx1, rx1) = mpsc::channel(8);
    let (tx2, rx2) = mpsc::channel(8);
    let source = MultiplexSource::new(vec![ChannelSource(rx1), ChannelSource(rx2)]);
    let mut rx = source.events().await.unwrap();

    tx1.send(Event::Added(obj("ns-a", "x"))).await.unwrap();
    tx1.send(Event::InitialListDone).await.unwrap();
    tx2.send(Event::Added(obj("ns-b", "y"))).await.unwrap();

    // both adds flow through; the first member's marker is held back
    for _ in 0..2 {
        let ev = recv(&mut rx).await;
        assert!(!matches!(ev, Event::InitialListDone));
    }

    tx2.send(Event::InitialListDone).await.unwrap();
    assert!(matches!(recv(&mut rx).await, Event::InitialListDone));
}

#[tokio::test]
async fn cache_syncs_only_after_every_member_lists() {
    let (tx1, rx1) = mpsc::channel(8);
    let (tx2, rx2) = mpsc::channel(8);
    let cache: Cache<LiteObj> = Cache::new();
    let _handle = cache
        .start(MultiplexSource::new(vec![ChannelSource(rx1), ChannelSource(rx2)]))
        .await
        .unwrap();

    tx1.send(Event::Added(obj("ns-a", "x"))).await.unwrap();
    tx1.send(Event::InitialListDone).await.unwrap();
    assert!(!cache.wait_until_synced(Duration::from_millis(100)).await);

    tx2.send(Event::Added(obj("ns-b", "y"))).await.unwrap();
    tx2.send(Event::InitialListDone).await.unwrap();
    assert!(cache.wait_until_synced(Duration::from_secs(5)).await);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn empty_multiplex_is_vacuously_listed() {
    let source: MultiplexSource<ChannelSource<LiteObj>> = MultiplexSource::new(Vec::new());
    let cache: Cache<LiteObj> = Cache::new();
    let _handle = cache.start(source).await.unwrap();
    assert!(cache.wait_until_synced(Duration::from_secs(5)).await);
    assert!(cache.is_empty());
}
