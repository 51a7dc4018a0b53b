use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter},
    Client,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vapscan_core::{EventType, Notification, NotificationSink, ObjectRef};

/// Notification sink publishing Kubernetes Events.
///
/// `emit` only enqueues into a bounded channel and drops the notification when
/// the queue is full; a background task performs the API calls.
pub struct KubeEventSink {
    tx: mpsc::Sender<Notification>,
}

impl KubeEventSink {
    /// Create the sink and spawn its publisher. The publisher exits once the sink is dropped.
    pub fn spawn(client: Client, reporter: impl Into<String>, cap: usize) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        let reporter = Reporter { controller: reporter.into(), instance: std::env::var("POD_NAME").ok() };
        let handle = tokio::spawn(publish_loop(client, reporter, rx));
        (Self { tx }, handle)
    }
}

impl NotificationSink for KubeEventSink {
    fn emit(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            metrics::counter!("events_dropped_total", 1u64);
            debug!(error = %e, "event queue full or closed; dropping notification");
        }
    }
}

pub(crate) fn object_reference(r: &ObjectRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(r.api_version.clone()),
        kind: Some(r.kind.clone()),
        name: Some(r.name.clone()),
        namespace: r.namespace.clone(),
        uid: r.uid.clone(),
        ..Default::default()
    }
}

pub(crate) fn to_event(n: &Notification) -> Event {
    Event {
        type_: match n.event_type {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        },
        reason: n.reason.clone(),
        note: Some(n.message.clone()),
        action: "Scan".to_string(),
        secondary: None,
    }
}

async fn publish_loop(client: Client, reporter: Reporter, mut rx: mpsc::Receiver<Notification>) {
    let mut published = 0u64;
    while let Some(n) = rx.recv().await {
        let recorder = Recorder::new(client.clone(), reporter.clone(), object_reference(&n.object));
        match recorder.publish(to_event(&n)).await {
            Ok(()) => {
                published += 1;
                metrics::counter!("events_published_total", 1u64);
            }
            Err(e) => {
                metrics::counter!("events_failed_total", 1u64);
                warn!(object = %n.object, reason = %n.reason, error = %e, "failed to publish event");
            }
        }
    }
    info!(published, "event publisher stopped");
}
