//! vapscan discovery: memoized resource catalog with scheduled invalidation.
//!
//! The API server offers no change notification for its served kinds, so the
//! cache is invalidated on a fixed interval instead. A kind removed remotely
//! stays visible, and a new kind stays invisible, until the next invalidation
//! or until the snapshot ages past `refresh_interval`.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vapscan_core::{Catalog, CatalogEntry, GvkKey, RemoteCatalogProvider, RemoteError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("catalog fetch failed: {0}")]
    Fetch(#[from] RemoteError),
    #[error("resource kind {0} is not served")]
    UnknownKind(String),
}

/// Smallest interval [`DiscoveryCache::poll`] will tick at.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Snapshot, fetch time and the invalidation generation it was fetched under.
/// Swapped as one unit so readers never pair a snapshot with another timestamp.
struct Cached {
    catalog: Arc<Catalog>,
    fetched_at: Instant,
    generation: u64,
}

pub struct DiscoveryCache {
    provider: Arc<dyn RemoteCatalogProvider>,
    refresh_interval: Duration,
    current: ArcSwapOption<Cached>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
    fetches: AtomicU64,
    last_error: Mutex<Option<RemoteError>>,
}

impl DiscoveryCache {
    pub fn new(provider: Arc<dyn RemoteCatalogProvider>, refresh_interval: Duration) -> Self {
        Self {
            provider,
            refresh_interval,
            current: ArcSwapOption::const_empty(),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
            fetches: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn refresh_interval(&self) -> Duration { self.refresh_interval }

    fn is_fresh(&self, c: &Cached) -> bool {
        c.generation == self.generation.load(Ordering::Acquire) && c.fetched_at.elapsed() < self.refresh_interval
    }

    fn fresh_snapshot(&self) -> Option<Arc<Catalog>> {
        let guard = self.current.load();
        guard.as_ref().filter(|c| self.is_fresh(c)).map(|c| Arc::clone(&c.catalog))
    }

    /// Current catalog. Fetches when the snapshot is missing, invalidated or
    /// older than the refresh interval. When that fetch fails and an older
    /// snapshot exists, the older snapshot is returned and the error is kept
    /// in [`last_error`](Self::last_error).
    pub async fn get(&self) -> Result<Arc<Catalog>, DiscoveryError> {
        if let Some(cat) = self.fresh_snapshot() {
            return Ok(cat);
        }
        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(cat) = self.fresh_snapshot() {
            return Ok(cat);
        }
        match self.fetch().await {
            Ok(cat) => Ok(cat),
            Err(e) => match self.cached() {
                Some(prev) => {
                    warn!(error = %e, entries = prev.len(), "discovery refresh failed; serving stale catalog");
                    Ok(prev)
                }
                None => Err(DiscoveryError::Fetch(e)),
            },
        }
    }

    /// Fetch unconditionally and surface any failure. The last good snapshot is kept on error.
    pub async fn refresh(&self) -> Result<Arc<Catalog>, DiscoveryError> {
        let _guard = self.refresh_lock.lock().await;
        Ok(self.fetch().await?)
    }

    /// Mark the snapshot stale. The next [`get`](Self::get) fetches.
    pub fn invalidate(&self) {
        let gen = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::counter!("discovery_invalidations_total", 1u64);
        debug!(generation = gen, "discovery cache invalidated");
    }

    /// Snapshot currently held, fresh or not, without fetching.
    pub fn cached(&self) -> Option<Arc<Catalog>> {
        self.current.load().as_ref().map(|c| Arc::clone(&c.catalog))
    }

    /// Number of provider calls made so far, successful or not.
    pub fn fetch_count(&self) -> u64 { self.fetches.load(Ordering::Acquire) }

    /// Error of the most recent failed fetch, cleared by the next successful one.
    pub fn last_error(&self) -> Option<RemoteError> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Look a kind up in the catalog. An unknown kind forces one refresh
    /// before giving up, so freshly registered CRDs resolve immediately.
    pub async fn resolve(&self, gvk: &GvkKey) -> Result<CatalogEntry, DiscoveryError> {
        let cat = self.get().await?;
        if let Some(e) = cat.find(gvk) {
            return Ok(e.clone());
        }
        debug!(gvk = %gvk, "kind not in cached catalog; refreshing");
        let cat = self.refresh().await?;
        cat.find(gvk).cloned().ok_or_else(|| DiscoveryError::UnknownKind(gvk.to_string()))
    }

    /// Invalidate every `interval` until `token` is cancelled. A zero
    /// interval is raised to [`MIN_POLL_INTERVAL`].
    pub async fn poll(&self, token: CancellationToken, interval: Duration) {
        if interval < MIN_POLL_INTERVAL {
            warn!(interval_ms = interval.as_millis() as u64, "discovery poll interval too small; clamping");
        }
        let interval = interval.max(MIN_POLL_INTERVAL);
        info!(interval_secs = interval.as_secs_f64(), "discovery poller started");
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.invalidate(),
            }
        }
        info!("discovery poller stopped");
    }

    /// Run [`poll`](Self::poll) on a background task.
    pub fn spawn_poll(self: &Arc<Self>, token: CancellationToken, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.poll(token, interval).await })
    }

    // Caller holds `refresh_lock`.
    async fn fetch(&self) -> Result<Arc<Catalog>, RemoteError> {
        // Read before the call: an invalidation racing the fetch must leave the result stale.
        let generation = self.generation.load(Ordering::Acquire);
        let started = Instant::now();
        self.fetches.fetch_add(1, Ordering::AcqRel);
        let res = self.provider.fetch_catalog().await;
        metrics::histogram!("discovery_fetch_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(catalog) => {
                let catalog = Arc::new(catalog);
                metrics::counter!("discovery_fetches_total", 1u64);
                metrics::gauge!("discovery_catalog_entries", catalog.len() as f64);
                self.current.store(Some(Arc::new(Cached {
                    catalog: Arc::clone(&catalog),
                    fetched_at: Instant::now(),
                    generation,
                })));
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                debug!(entries = catalog.len(), took_ms = %started.elapsed().as_millis(), "discovery catalog fetched");
                Ok(catalog)
            }
            Err(e) => {
                metrics::counter!("discovery_fetch_errors_total", 1u64);
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(e.clone());
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Catalog);

    #[async_trait::async_trait]
    impl RemoteCatalogProvider for Fixed {
        async fn fetch_catalog(&self) -> Result<Catalog, RemoteError> { Ok(self.0.clone()) }
    }

    #[tokio::test]
    async fn invalidation_racing_a_fetch_leaves_result_stale() {
        let cache = DiscoveryCache::new(Arc::new(Fixed(Catalog::default())), Duration::from_secs(60));
        cache.get().await.unwrap();
        // Simulate an invalidation that landed while the snapshot was being fetched.
        cache.current.store(Some(Arc::new(Cached {
            catalog: Arc::new(Catalog::default()),
            fetched_at: Instant::now(),
            generation: cache.generation.load(Ordering::Acquire),
        })));
        cache.invalidate();
        assert!(cache.fresh_snapshot().is_none());
        cache.get().await.unwrap();
        assert!(cache.fresh_snapshot().is_some());
        assert_eq!(cache.fetch_count(), 2);
    }
}
