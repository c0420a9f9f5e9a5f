#![forbid(unsafe_code)]

use std::time::Duration;

use ekspose_core::{LogicalKey, PrimaryObject, StreamEvent, WatchEvent};
use ekspose_store::spawn_ingest;

fn obj(ns: &str, name: &str) -> PrimaryObject {
    PrimaryObject { namespace: ns.into(), name: name.into(), uid: format!("{}-{}", ns, name), ..Default::default() }
}

async fn run_sequence(seq: &[StreamEvent]) -> Vec<LogicalKey> {
    let (tx, mirror) = spawn_ingest(128, Vec::new());
    for ev in seq.iter().cloned() {
        let _ = tx.send(ev).await;
    }
    drop(tx);
    // Let ingest flush final snapshot
    tokio::time::sleep(Duration::from_millis(30)).await;
    mirror.current().keys()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deterministic_across_runs() {
    let seq = vec![
        StreamEvent::Relisted(vec![obj("ns1", "a"), obj("ns2", "b")]),
        StreamEvent::Event(WatchEvent::Added(obj("ns3", "c"))),
        // duplicates and a delete interleaved
        StreamEvent::Event(WatchEvent::Updated(obj("ns2", "b"))),
        StreamEvent::Event(WatchEvent::Updated(obj("ns2", "b"))),
        StreamEvent::Event(WatchEvent::Deleted(obj("ns3", "c"))),
        StreamEvent::Event(WatchEvent::Added(obj("prod", "d"))),
    ];
    let c1 = run_sequence(&seq).await;
    let c2 = run_sequence(&seq).await;
    assert_eq!(c1, c2, "mirror content must be deterministic across runs");
    assert_eq!(
        c1,
        vec![LogicalKey::new("ns1", "a"), LogicalKey::new("ns2", "b"), LogicalKey::new("prod", "d")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wait_ready_resolves_after_first_listing() {
    let (tx, mirror) = spawn_ingest(16, Vec::new());
    assert!(!mirror.ready());
    let waiter = tokio::spawn({
        let mirror = mirror.clone();
        async move { mirror.wait_ready().await }
    });
    tx.send(StreamEvent::Relisted(vec![obj("app", "web")])).await.unwrap();
    let warm = tokio::time::timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
    assert!(warm);
    assert!(mirror.get("app", "web").is_some());
}

#[tokio::test]
async fn wait_ready_gives_up_when_stream_closes_cold() {
    let (tx, mirror) = spawn_ingest(16, Vec::new());
    drop(tx);
    let warm = tokio::time::timeout(Duration::from_secs(2), mirror.wait_ready()).await.unwrap();
    assert!(!warm);
}
