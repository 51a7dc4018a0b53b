//! vapscan store: name-keyed in-RAM object index, a read-only lister over it,
//! and the synchronizer loop that feeds watcher deltas into the index.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use vapscan_core::{Delta, DeltaKind, IndexedObject, LabelSelector, Labels};

/// Objects that can live in an [`ObjectIndex`].
pub trait Keyed: Send + Sync {
    /// Unique name within the index.
    fn key(&self) -> &str;
    fn labels(&self) -> &Labels;
}

impl Keyed for IndexedObject {
    fn key(&self) -> &str { self.name() }
    fn labels(&self) -> &Labels { &self.labels }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{resource} {name:?} not found")]
    NotFound { resource: String, name: String },
}

/// Thread-safe map from name to object. Last writer wins per name.
///
/// Locks are held only for the map operation itself. Entries are stored as
/// `Arc<T>`, so readers clone pointers and never observe a half-written object.
pub struct ObjectIndex<T> {
    items: RwLock<FxHashMap<String, Arc<T>>>,
    synced: AtomicBool,
}

impl<T: Keyed> Default for ObjectIndex<T> {
    fn default() -> Self { Self::new() }
}

impl<T: Keyed> ObjectIndex<T> {
    pub fn new() -> Self { Self { items: RwLock::new(FxHashMap::default()), synced: AtomicBool::new(false) } }

    // A panicking writer cannot leave a half-applied insert behind, so poison is ignored.
    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, Arc<T>>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, Arc<T>>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the entry keyed by the object's name.
    pub fn upsert(&self, obj: T) {
        let obj = Arc::new(obj);
        let len = {
            let mut items = self.write();
            items.insert(obj.key().to_string(), obj);
            items.len()
        };
        metrics::gauge!("index_objects", len as f64);
    }

    /// Remove the entry if present. Returns whether something was removed.
    pub fn delete(&self, name: &str) -> bool {
        let (removed, len) = {
            let mut items = self.write();
            let removed = items.remove(name).is_some();
            (removed, items.len())
        };
        metrics::gauge!("index_objects", len as f64);
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.read().get(name).cloned()
    }

    /// All entries whose labels match `selector`, in unspecified order.
    /// The result is a snapshot taken under one read lock.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<T>> {
        self.read().values().filter(|o| selector.matches(o.labels())).cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Replace the full contents, e.g. after a watcher relist.
    pub fn replace_all(&self, objects: Vec<T>) {
        let mut next = FxHashMap::default();
        next.reserve(objects.len());
        for o in objects {
            next.insert(o.key().to_string(), Arc::new(o));
        }
        let len = next.len();
        *self.write() = next;
        self.synced.store(true, Ordering::Release);
        metrics::gauge!("index_objects", len as f64);
    }

    /// Whether a full listing has been loaded at least once.
    pub fn has_synced(&self) -> bool { self.synced.load(Ordering::Acquire) }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }
}

impl ObjectIndex<IndexedObject> {
    pub fn apply(&self, delta: Delta) {
        match delta.kind {
            DeltaKind::Applied => {
                metrics::counter!("index_deltas_total", 1u64, "kind" => "applied");
                self.upsert(delta.object);
            }
            DeltaKind::Deleted => {
                metrics::counter!("index_deltas_total", 1u64, "kind" => "deleted");
                self.delete(delta.object.name());
            }
        }
    }
}

/// Read-only query façade over an [`ObjectIndex`].
pub struct Lister<T> {
    index: Arc<ObjectIndex<T>>,
    resource: String,
}

impl<T> Clone for Lister<T> {
    fn clone(&self) -> Self {
        Self { index: Arc::clone(&self.index), resource: self.resource.clone() }
    }
}

impl<T: Keyed> Lister<T> {
    /// `resource` names the object kind in not-found errors.
    pub fn new(index: Arc<ObjectIndex<T>>, resource: impl Into<String>) -> Self {
        Self { index, resource: resource.into() }
    }

    /// Objects returned here must be treated as read-only.
    pub fn get(&self, name: &str) -> Result<Arc<T>, StoreError> {
        self.index.get(name).ok_or_else(|| StoreError::NotFound { resource: self.resource.clone(), name: name.to_string() })
    }

    /// Objects returned here must be treated as read-only.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<T>> {
        self.index.list(selector)
    }

    pub fn has_synced(&self) -> bool { self.index.has_synced() }
}

/// Input to the synchronizer loop.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Delta(Delta),
    /// Full listing that replaces the index contents.
    Relist(Vec<IndexedObject>),
}

/// Spawn a loop applying sync events to `index` in arrival order until every sender is dropped.
pub fn spawn_sync(index: Arc<ObjectIndex<IndexedObject>>, mut rx: mpsc::Receiver<SyncEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut applied = 0u64;
        while let Some(ev) = rx.recv().await {
            match ev {
                SyncEvent::Delta(d) => index.apply(d),
                SyncEvent::Relist(objects) => {
                    debug!(count = objects.len(), "relist");
                    index.replace_all(objects);
                }
            }
            applied += 1;
        }
        info!(applied, objects = index.len(), "index sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vapscan_core::ObjectRef;

    fn obj(name: &str, labels: &[(&str, &str)], payload: serde_json::Value) -> IndexedObject {
        IndexedObject::new(
            ObjectRef { kind: "ValidatingAdmissionPolicy".into(), name: name.into(), ..Default::default() },
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            payload,
        )
    }

    #[test]
    fn upsert_replaces_by_name() {
        let idx = ObjectIndex::new();
        idx.upsert(obj("a", &[], serde_json::json!({"v": 1})));
        idx.upsert(obj("a", &[], serde_json::json!({"v": 2})));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.get("a").unwrap().payload["v"], 2);
    }

    #[test]
    fn delete_missing_is_noop() {
        let idx: ObjectIndex<IndexedObject> = ObjectIndex::new();
        assert!(!idx.delete("ghost"));
        idx.upsert(obj("a", &[], serde_json::Value::Null));
        assert!(idx.delete("a"));
        assert!(idx.is_empty());
    }

    #[test]
    fn lister_distinguishes_missing_from_empty_payload() {
        let idx = Arc::new(ObjectIndex::new());
        idx.upsert(obj("empty", &[], serde_json::Value::Null));
        let lister = Lister::new(Arc::clone(&idx), "validatingadmissionpolicy");
        assert_eq!(lister.get("empty").unwrap().payload, serde_json::Value::Null);
        assert_eq!(
            lister.get("missing").unwrap_err(),
            StoreError::NotFound { resource: "validatingadmissionpolicy".into(), name: "missing".into() }
        );
    }

    #[test]
    fn list_filters_by_selector() {
        let idx = Arc::new(ObjectIndex::new());
        idx.upsert(obj("a", &[("app.kubernetes.io/instance", "kyverno")], serde_json::Value::Null));
        idx.upsert(obj("b", &[("app.kubernetes.io/instance", "other")], serde_json::Value::Null));
        idx.upsert(obj("c", &[], serde_json::Value::Null));
        let lister = Lister::new(idx, "policy");

        let mut names: Vec<_> = lister.list(&LabelSelector::eq("app.kubernetes.io/instance", "kyverno")).iter().map(|o| o.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["a"]);
        assert_eq!(lister.list(&LabelSelector::everything()).len(), 3);
        assert!(lister.list(&"team=x".parse().unwrap()).is_empty());
    }

    #[test]
    fn apply_and_replace_all() {
        let idx = ObjectIndex::new();
        idx.apply(Delta { kind: DeltaKind::Applied, object: obj("a", &[], serde_json::Value::Null) });
        idx.apply(Delta { kind: DeltaKind::Applied, object: obj("b", &[], serde_json::Value::Null) });
        idx.apply(Delta { kind: DeltaKind::Deleted, object: obj("a", &[], serde_json::Value::Null) });
        assert_eq!(idx.keys(), vec!["b".to_string()]);
        assert!(!idx.has_synced());

        idx.replace_all(vec![obj("x", &[], serde_json::Value::Null), obj("y", &[], serde_json::Value::Null)]);
        let mut keys = idx.keys();
        keys.sort();
        assert_eq!(keys, vec!["x", "y"]);
        assert!(idx.has_synced());
    }
}
