use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{Stream, StreamExt};
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vapscan_core::{CatalogEntry, Delta, DeltaKind, GvkKey, IndexedObject, LabelSelector};
use vapscan_discovery::DiscoveryCache;
use vapscan_store::SyncEvent;

use crate::{api_resource, to_indexed};

fn convert(objs: &[DynamicObject], entry: &CatalogEntry) -> Vec<IndexedObject> {
    objs.iter()
        .filter_map(|o| match to_indexed(o, entry) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(error = %e, "skipping unconvertible object");
                None
            }
        })
        .collect()
}

fn sync_event(ev: Event<DynamicObject>, entry: &CatalogEntry) -> Option<SyncEvent> {
    let delta = |kind, o: &DynamicObject| match to_indexed(o, entry) {
        Ok(object) => Some(SyncEvent::Delta(Delta { kind, object })),
        Err(e) => {
            debug!(error = %e, "skipping unconvertible object");
            None
        }
    };
    match ev {
        Event::Applied(o) => delta(DeltaKind::Applied, &o),
        Event::Deleted(o) => delta(DeltaKind::Deleted, &o),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            Some(SyncEvent::Relist(convert(&list, entry)))
        }
    }
}

/// List+watch `target` objects matching `selector` and forward changes to the
/// index synchronizer until `token` is cancelled or the receiver goes away.
/// Watch errors are logged and retried with backoff.
pub async fn start_watcher(
    client: Client,
    cache: Arc<DiscoveryCache>,
    target: &GvkKey,
    selector: &LabelSelector,
    tx: mpsc::Sender<SyncEvent>,
    token: CancellationToken,
) -> Result<()> {
    let entry = cache.resolve(target).await.with_context(|| format!("resolving {}", target))?;
    let api: Api<DynamicObject> = Api::all_with(client, &api_resource(&entry));

    let mut cfg = watcher::Config::default();
    if !selector.is_empty() {
        cfg = cfg.labels(&selector.to_string());
    }
    info!(gvk = %target, selector = %selector, "watcher started");
    forward(watcher::watcher(api, cfg).default_backoff(), &entry, &tx, &token).await
}

// Drain a watch stream into `tx`. Stream errors do not end the loop.
pub(crate) async fn forward<S>(
    stream: S,
    entry: &CatalogEntry,
    tx: &mpsc::Sender<SyncEvent>,
    token: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>>,
{
    futures::pin_mut!(stream);
    loop {
        let item = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(kind = %entry.kind, "watcher cancelled");
                return Ok(());
            }
            item = stream.next() => item,
        };
        let ev = match item {
            None => break,
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                metrics::counter!("watch_errors_total", 1u64);
                warn!(kind = %entry.kind, error = %e, "watch stream error; retrying");
                continue;
            }
        };
        let Some(out) = sync_event(ev, entry) else { continue };
        if tx.send(out).await.is_err() {
            return Err(anyhow!("index synchronizer closed"));
        }
    }
    warn!(kind = %entry.kind, "watcher stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn vap_entry() -> CatalogEntry {
        CatalogEntry {
            group: "admissionregistration.k8s.io".into(),
            version: "v1beta1".into(),
            kind: "ValidatingAdmissionPolicy".into(),
            plural: "validatingadmissionpolicies".into(),
            namespaced: false,
        }
    }

    fn policy(name: &str) -> DynamicObject {
        DynamicObject::new(name, &api_resource(&vap_entry()))
    }

    fn gone() -> watcher::Error {
        watcher::Error::WatchError(ErrorResponse {
            status: "Failure".into(),
            message: "too old resource version".into(),
            reason: "Expired".into(),
            code: 410,
        })
    }

    fn name_of(ev: &SyncEvent) -> (&'static str, String) {
        match ev {
            SyncEvent::Delta(d) => {
                let kind = if d.kind == DeltaKind::Applied { "applied" } else { "deleted" };
                (kind, d.object.name().to_string())
            }
            SyncEvent::Relist(list) => ("relist", list.len().to_string()),
        }
    }

    #[tokio::test]
    async fn stream_errors_do_not_stop_forwarding() {
        let items = vec![
            Ok(Event::Restarted(vec![policy("p0")])),
            Ok(Event::Applied(policy("p1"))),
            Err(gone()),
            Ok(Event::Applied(policy("p2"))),
            Err(gone()),
            Ok(Event::Deleted(policy("p1"))),
        ];
        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        forward(futures::stream::iter(items), &vap_entry(), &tx, &token).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(name_of(&ev));
        }
        assert_eq!(
            seen,
            vec![
                ("relist", "1".to_string()),
                ("applied", "p1".to_string()),
                ("applied", "p2".to_string()),
                ("deleted", "p1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_forwarder_returns_ok() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        token.cancel();
        let pending = futures::stream::pending::<Result<Event<DynamicObject>, watcher::Error>>();
        forward(pending, &vap_entry(), &tx, &token).await.unwrap();
    }

    #[tokio::test]
    async fn closed_synchronizer_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let token = CancellationToken::new();
        let items = vec![Ok(Event::Applied(policy("p1")))];
        assert!(forward(futures::stream::iter(items), &vap_entry(), &tx, &token).await.is_err());
    }
}
