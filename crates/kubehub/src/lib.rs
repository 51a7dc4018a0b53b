//! vapscan kubehub: kube-rs implementations of the catalog provider, object
//! store and notification sink, plus the watcher feeding the local index.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::{debug, info};
use vapscan_core::{
    Catalog, CatalogEntry, GvkKey, IndexedObject, LabelSelector, ObjectRef, RemoteCatalogProvider, RemoteError,
    RemoteObjectStore,
};
use vapscan_discovery::{DiscoveryCache, DiscoveryError};

mod events;
mod watch;

pub use events::KubeEventSink;
pub use watch::start_watcher;

/// Build a client from the ambient kubeconfig or in-cluster config.
pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster config)")
}

/// Classify a kube error for the scanner: transport and credential failures
/// are `Unreachable`, API 404 is `NotFound`, anything else is `Api`.
pub fn remote_error(e: kube::Error) -> RemoteError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => RemoteError::NotFound(resp.message),
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
            RemoteError::Unreachable(format!("{} ({})", resp.message, resp.code))
        }
        kube::Error::Api(resp) => RemoteError::Api(format!("{} ({})", resp.message, resp.code)),
        e @ (kube::Error::HyperError(_) | kube::Error::Service(_) | kube::Error::Auth(_) | kube::Error::InferConfig(_)) => {
            RemoteError::Unreachable(e.to_string())
        }
        other => RemoteError::Api(other.to_string()),
    }
}

fn discovery_error(e: DiscoveryError) -> RemoteError {
    match e {
        DiscoveryError::Fetch(e) => e,
        DiscoveryError::UnknownKind(k) => RemoteError::NotFound(format!("resource kind {} is not served", k)),
    }
}

pub fn api_resource(entry: &CatalogEntry) -> ApiResource {
    ApiResource {
        group: entry.group.clone(),
        version: entry.version.clone(),
        api_version: entry.api_version(),
        kind: entry.kind.clone(),
        plural: entry.plural.clone(),
    }
}

/// Catalog provider running full API discovery on each fetch.
#[derive(Clone)]
pub struct KubeCatalogProvider {
    client: Client,
}

impl KubeCatalogProvider {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl RemoteCatalogProvider for KubeCatalogProvider {
    async fn fetch_catalog(&self) -> Result<Catalog, RemoteError> {
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(remote_error)?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(CatalogEntry {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        debug!(entries = out.len(), "discovery run complete");
        Ok(Catalog::new(out))
    }
}

/// Lists objects of one kind across all namespaces, resolving the kind through the discovery cache.
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
    cache: Arc<DiscoveryCache>,
    target: GvkKey,
}

impl KubeObjectStore {
    pub fn new(client: Client, cache: Arc<DiscoveryCache>, target: GvkKey) -> Self {
        Self { client, cache, target }
    }

    pub fn target(&self) -> &GvkKey { &self.target }

    async fn api(&self) -> Result<(Api<DynamicObject>, CatalogEntry), RemoteError> {
        let entry = self.cache.resolve(&self.target).await.map_err(discovery_error)?;
        let api = Api::all_with(self.client.clone(), &api_resource(&entry));
        Ok((api, entry))
    }
}

#[async_trait::async_trait]
impl RemoteObjectStore for KubeObjectStore {
    async fn list_objects(&self, filter: &LabelSelector) -> Result<Vec<IndexedObject>, RemoteError> {
        let (api, entry) = self.api().await?;
        let lp = list_params(filter);
        let list = api.list(&lp).await.map_err(remote_error)?;
        let mut out = Vec::with_capacity(list.items.len());
        for obj in list.items.iter() {
            match to_indexed(obj, &entry) {
                Ok(o) => out.push(o),
                Err(e) => debug!(error = %e, "skipping object without a name"),
            }
        }
        info!(gvk = %self.target, filter = %filter, count = out.len(), "listed objects");
        Ok(out)
    }
}

pub(crate) fn list_params(filter: &LabelSelector) -> ListParams {
    if filter.is_empty() { ListParams::default() } else { ListParams::default().labels(&filter.to_string()) }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Convert a dynamic object into the index representation.
pub fn to_indexed(obj: &DynamicObject, entry: &CatalogEntry) -> Result<IndexedObject> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let (api_version, kind) = match &obj.types {
        Some(t) => (t.api_version.clone(), t.kind.clone()),
        None => (entry.api_version(), entry.kind.clone()),
    };
    let reference = ObjectRef {
        api_version,
        kind,
        namespace: obj.metadata.namespace.clone(),
        name,
        uid: obj.metadata.uid.clone(),
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    let mut payload = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut payload);
    Ok(IndexedObject::new(reference, labels, payload))
}
