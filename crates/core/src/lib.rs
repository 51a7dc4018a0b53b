//! vapscan core types: catalog entries, indexed objects, scan outcomes and
//! the narrow collaborator traits the cache and scanner call into.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod selector;
pub mod settings;

pub use selector::{LabelSelector, Requirement};
pub use settings::Settings;

/// Kubernetes labels as an ordered key/value map.
pub type Labels = BTreeMap<String, String>;

/// Default message recorded for an object that was processed without a custom message.
pub const SCANNED_MESSAGE: &str = "ValidatingAdmissionPolicy scanned successfully";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("invalid label selector {input:?}: {reason}")]
    InvalidSelector { input: String, reason: String },
}

/// Failures reported by the remote collaborators.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Connection, TLS or credential failure; the server was never reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),
    #[error("remote not found: {0}")]
    NotFound(String),
    #[error("remote api error: {0}")]
    Api(String),
}

// ---- catalog ----

/// Group/Version/Kind triple addressed as `v1/Kind` or `group/v1/Kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GvkKey {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl FromStr for GvkKey {
    type Err = CoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<_> = key.split('/').collect();
        let (group, version, kind) = match parts.as_slice() {
            [version, kind] => ("", *version, *kind),
            [group, version, kind] => (*group, *version, *kind),
            _ => return Err(CoreError::InvalidGvk(key.to_string())),
        };
        if version.is_empty() || kind.is_empty() {
            return Err(CoreError::InvalidGvk(key.to_string()));
        }
        Ok(Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() })
    }
}

impl fmt::Display for GvkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// One served resource kind as reported by the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl CatalogEntry {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn matches(&self, gvk: &GvkKey) -> bool {
        self.group == gvk.group && self.version == gvk.version && self.kind == gvk.kind
    }
}

/// Immutable snapshot of every served resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
}

impl Catalog {
    /// Build a catalog with entries in stable group/version/kind order.
    pub fn new(mut entries: Vec<CatalogEntry>) -> Self {
        entries.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        Self { entries }
    }

    pub fn find(&self, gvk: &GvkKey) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.matches(gvk))
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

// ---- objects ----

/// Reference to a remote object, enough to address it in a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Remote object held in the local index: reference, labels and the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedObject {
    pub reference: ObjectRef,
    pub labels: Labels,
    /// Raw object (managed fields stripped by the kube integration).
    pub payload: serde_json::Value,
}

impl IndexedObject {
    pub fn new(reference: ObjectRef, labels: Labels, payload: serde_json::Value) -> Self {
        Self { reference, labels, payload }
    }

    /// Stable index key.
    pub fn name(&self) -> &str { &self.reference.name }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Applied,
    Deleted,
}

/// One change observed by a watcher, applied to the local index in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: IndexedObject,
}

// ---- scan results ----

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScanStatus {
    Succeeded,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Succeeded => "succeeded",
            ScanStatus::Failed => "failed",
        }
    }
}

/// Result of processing one object in one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanOutcome {
    pub object: ObjectRef,
    pub status: ScanStatus,
    pub message: Option<String>,
}

impl ScanOutcome {
    pub fn succeeded(object: ObjectRef, message: Option<String>) -> Self {
        Self { object, status: ScanStatus::Succeeded, message }
    }

    pub fn failed(object: ObjectRef, message: impl Into<String>) -> Self {
        Self { object, status: ScanStatus::Failed, message: Some(message.into()) }
    }

    pub fn into_notification(self) -> Notification {
        let (event_type, reason, fallback) = match self.status {
            ScanStatus::Succeeded => (EventType::Normal, "Scanned", SCANNED_MESSAGE),
            ScanStatus::Failed => (EventType::Warning, "ScanFailed", "ValidatingAdmissionPolicy scan failed"),
        };
        Notification {
            object: self.object,
            event_type,
            reason: reason.to_string(),
            message: self.message.unwrap_or_else(|| fallback.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A constructed event ready to hand to a sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub object: ObjectRef,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

// ---- collaborators ----

/// Source of the served resource catalog.
#[async_trait::async_trait]
pub trait RemoteCatalogProvider: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Catalog, RemoteError>;
}

/// Remote object listing, filtered by a label selector.
#[async_trait::async_trait]
pub trait RemoteObjectStore: Send + Sync {
    async fn list_objects(&self, filter: &LabelSelector) -> Result<Vec<IndexedObject>, RemoteError>;
}

/// Fire-and-forget event sink. Implementations must not block the caller and
/// handle their own delivery failures.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

pub mod prelude {
    pub use super::{
        Catalog, CatalogEntry, Delta, DeltaKind, EventType, GvkKey, IndexedObject, LabelSelector, Labels,
        Notification, NotificationSink, ObjectRef, RemoteCatalogProvider, RemoteError, RemoteObjectStore,
        ScanOutcome, ScanStatus,
    };
}
