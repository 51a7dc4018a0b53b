//! vapscan scan: cancellable periodic scan loop.
//!
//! Each tick lists the filtered objects from the remote store, runs the
//! processor on every object and emits one notification per outcome. A failed
//! tick is logged and the next one runs on schedule; a failed object only
//! fails its own outcome.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vapscan_core::{
    IndexedObject, LabelSelector, NotificationSink, ObjectRef, RemoteError, RemoteObjectStore, ScanOutcome, ScanStatus,
    Settings,
};

mod processor;

pub use processor::{FnProcessor, ObjectProcessor, RecordScanned};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("listing objects failed: {0}")]
    List(#[source] RemoteError),
    /// The object store was unreachable on the very first tick.
    #[error("scan setup failed: {0}")]
    Setup(#[source] RemoteError),
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Sleep between ticks.
    pub interval: Duration,
    /// Selector for the managed object subset.
    pub filter: LabelSelector,
    /// Objects processed in parallel within one tick.
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self { Self::from(&Settings::default()) }
}

impl From<&Settings> for ScanOptions {
    fn from(s: &Settings) -> Self {
        Self { interval: s.scan_interval, filter: s.object_filter.clone(), concurrency: s.concurrency.max(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// One scheduler iteration: the listed candidates and their outcomes, in listing order.
#[derive(Debug, Clone, Serialize)]
pub struct ScanTick {
    pub started_at: DateTime<Utc>,
    pub candidates: Vec<ObjectRef>,
    pub outcomes: Vec<ScanOutcome>,
}

impl ScanTick {
    pub fn summary(&self) -> TickSummary {
        let failed = self.outcomes.iter().filter(|o| o.status == ScanStatus::Failed).count();
        TickSummary { succeeded: self.outcomes.len() - failed, failed }
    }
}

pub struct ScanScheduler {
    store: Arc<dyn RemoteObjectStore>,
    processor: Arc<dyn ObjectProcessor>,
    sink: Arc<dyn NotificationSink>,
    opts: ScanOptions,
    state_tx: watch::Sender<SchedulerState>,
    ticks: AtomicU64,
}

impl ScanScheduler {
    pub fn new(
        store: Arc<dyn RemoteObjectStore>,
        processor: Arc<dyn ObjectProcessor>,
        sink: Arc<dyn NotificationSink>,
        opts: ScanOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SchedulerState::Idle);
        Self { store, processor, sink, opts, state_tx, ticks: AtomicU64::new(0) }
    }

    pub fn options(&self) -> &ScanOptions { &self.opts }

    pub fn state(&self) -> SchedulerState { *self.state_tx.borrow() }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> { self.state_tx.subscribe() }

    /// Ticks started so far, including failed ones.
    pub fn ticks(&self) -> u64 { self.ticks.load(Ordering::Acquire) }

    fn set_state(&self, s: SchedulerState) {
        self.state_tx.send_replace(s);
    }

    /// Run until `token` is cancelled. Cancellation returns `Ok(())`; the only
    /// error is [`ScanError::Setup`] when the store is unreachable on the first tick.
    /// An in-flight tick is allowed to finish; the inter-tick sleep is not.
    pub async fn start(&self, token: CancellationToken) -> Result<(), ScanError> {
        info!(interval_secs = self.opts.interval.as_secs(), filter = %self.opts.filter, concurrency = self.opts.concurrency, "scan loop started");
        let mut first = true;
        loop {
            if token.is_cancelled() {
                self.set_state(SchedulerState::Stopped);
                info!(ticks = self.ticks(), "scan loop stopped");
                return Ok(());
            }
            self.set_state(SchedulerState::Running);
            match self.scan_step().await {
                Ok(tick) => {
                    let s = tick.summary();
                    info!(candidates = tick.candidates.len(), succeeded = s.succeeded, failed = s.failed, "scan tick done");
                }
                Err(ScanError::List(RemoteError::Unreachable(msg))) if first => {
                    self.set_state(SchedulerState::Stopped);
                    error!(error = %msg, "object store unreachable on first scan; giving up");
                    return Err(ScanError::Setup(RemoteError::Unreachable(msg)));
                }
                Err(e) => error!(error = %e, "scan tick failed; retrying next interval"),
            }
            first = false;
            self.set_state(SchedulerState::Idle);
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.opts.interval) => {}
            }
        }
    }

    /// Spawn [`start`](Self::start) on a background task.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<Result<(), ScanError>> {
        let me = Arc::clone(self);
        tokio::spawn(async move { me.start(token).await })
    }

    /// One tick: list, process every object, emit every outcome.
    pub async fn scan_step(&self) -> Result<ScanTick, ScanError> {
        let started = Instant::now();
        let started_at = Utc::now();
        self.ticks.fetch_add(1, Ordering::AcqRel);
        metrics::counter!("scan_ticks_total", 1u64);

        let objects = self.store.list_objects(&self.opts.filter).await.map_err(|e| {
            metrics::counter!("scan_list_errors_total", 1u64);
            ScanError::List(e)
        })?;
        let candidates: Vec<ObjectRef> = objects.iter().map(|o| o.reference.clone()).collect();

        // `buffered` yields in input order, so outcome i always belongs to object i.
        let processor = self.processor.as_ref();
        let pending: Vec<_> = objects.iter().map(|obj| process_one(processor, obj)).collect();
        let outcomes: Vec<ScanOutcome> = futures::stream::iter(pending)
            .buffered(self.opts.concurrency.max(1))
            .collect()
            .await;

        for outcome in &outcomes {
            metrics::counter!("scan_outcomes_total", 1u64, "status" => outcome.status.as_str());
            self.sink.emit(outcome.clone().into_notification());
        }
        metrics::histogram!("scan_tick_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(ScanTick { started_at, candidates, outcomes })
    }
}

async fn process_one(processor: &dyn ObjectProcessor, obj: &IndexedObject) -> ScanOutcome {
    let reference = obj.reference.clone();
    match AssertUnwindSafe(processor.process(obj)).catch_unwind().await {
        Ok(Ok(message)) => ScanOutcome::succeeded(reference, message),
        Ok(Err(e)) => {
            let message = format!("{:#}", e);
            warn!(object = %reference, error = %message, "object scan failed");
            ScanOutcome::failed(reference, message)
        }
        Err(_) => {
            error!(object = %reference, "object processor panicked");
            ScanOutcome::failed(reference, "processor panicked")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vapscan_core::Notification;

    struct Empty;

    #[async_trait::async_trait]
    impl RemoteObjectStore for Empty {
        async fn list_objects(&self, _filter: &LabelSelector) -> Result<Vec<IndexedObject>, RemoteError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Notification>>);

    impl NotificationSink for Collect {
        fn emit(&self, n: Notification) { self.0.lock().unwrap().push(n); }
    }

    #[test]
    fn options_follow_settings() {
        let mut s = Settings::default();
        s.concurrency = 0;
        s.scan_interval = Duration::from_secs(7);
        let o = ScanOptions::from(&s);
        assert_eq!(o.concurrency, 1);
        assert_eq!(o.interval, Duration::from_secs(7));
        assert_eq!(ScanOptions::default().interval, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn empty_listing_emits_nothing() {
        let sink = Arc::new(Collect::default());
        let sched = ScanScheduler::new(Arc::new(Empty), Arc::new(RecordScanned), sink.clone(), ScanOptions::default());
        assert_eq!(sched.state(), SchedulerState::Idle);
        let tick = sched.scan_step().await.unwrap();
        assert!(tick.outcomes.is_empty());
        assert_eq!(tick.summary(), TickSummary::default());
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(sched.ticks(), 1);
    }
}
