#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::sync::mpsc;
use vapscan_core::{Delta, DeltaKind, IndexedObject, LabelSelector, ObjectRef};
use vapscan_store::{spawn_sync, Lister, ObjectIndex, SyncEvent};

fn obj(name: &str, rev: u32) -> IndexedObject {
    IndexedObject::new(
        ObjectRef { kind: "ValidatingAdmissionPolicy".into(), name: name.into(), ..Default::default() },
        [("app.kubernetes.io/instance".to_string(), "kyverno".to_string())].into_iter().collect(),
        serde_json::json!({ "metadata": { "name": name, "resourceVersion": rev.to_string() } }),
    )
}

fn applied(name: &str, rev: u32) -> SyncEvent {
    SyncEvent::Delta(Delta { kind: DeltaKind::Applied, object: obj(name, rev) })
}

fn deleted(name: &str) -> SyncEvent {
    SyncEvent::Delta(Delta { kind: DeltaKind::Deleted, object: obj(name, 0) })
}

async fn replay(seq: Vec<SyncEvent>) -> Arc<ObjectIndex<IndexedObject>> {
    let index = Arc::new(ObjectIndex::new());
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn_sync(Arc::clone(&index), rx);
    for ev in seq {
        tx.send(ev).await.unwrap();
    }
    drop(tx);
    handle.await.unwrap();
    index
}

fn canon(index: &ObjectIndex<IndexedObject>) -> Vec<(String, String)> {
    let mut out: Vec<_> = index
        .list(&LabelSelector::everything())
        .iter()
        .map(|o| (o.name().to_string(), o.payload["metadata"]["resourceVersion"].as_str().unwrap_or("").to_string()))
        .collect();
    out.sort_unstable();
    out
}

#[tokio::test]
async fn last_writer_wins_per_name() {
    let index = replay(vec![
        applied("a", 1),
        applied("b", 1),
        applied("a", 2),
        deleted("b"),
        applied("c", 1),
        applied("b", 3),
        deleted("c"),
        deleted("never-existed"),
    ])
    .await;
    assert_eq!(canon(&index), vec![("a".into(), "2".into()), ("b".into(), "3".into())]);

    let lister = Lister::new(index, "validatingadmissionpolicy");
    assert!(lister.get("c").is_err());
    assert_eq!(lister.get("a").unwrap().payload["metadata"]["resourceVersion"], "2");
}

#[tokio::test]
async fn relist_replaces_previous_contents() {
    let index = replay(vec![
        applied("stale", 1),
        SyncEvent::Relist(vec![obj("p1", 4), obj("p2", 5)]),
        applied("p3", 6),
    ])
    .await;
    assert_eq!(
        canon(&index),
        vec![("p1".into(), "4".into()), ("p2".into(), "5".into()), ("p3".into(), "6".into())]
    );
}

#[tokio::test]
async fn deterministic_across_runs() {
    let seq = || vec![applied("a", 1), applied("b", 2), applied("a", 3), deleted("b"), applied("d", 4)];
    let c1 = canon(&*replay(seq()).await);
    let c2 = canon(&*replay(seq()).await);
    assert_eq!(c1, c2, "canonical index view must be deterministic across runs");
}
