use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vapscan_core::{EventType, GvkKey, IndexedObject, LabelSelector, Notification, NotificationSink, Settings};
use vapscan_discovery::DiscoveryCache;
use vapscan_kubehub::{KubeCatalogProvider, KubeEventSink, KubeObjectStore};
use vapscan_scan::{RecordScanned, ScanOptions, ScanScheduler, ScanTick};
use vapscan_store::{spawn_sync, Lister, ObjectIndex};

#[derive(Parser, Debug)]
#[command(name = "vapscanctl", version, about = "Periodic background scan of ValidatingAdmissionPolicies")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Resource kind to scan, e.g. "admissionregistration.k8s.io/v1/ValidatingAdmissionPolicy"
    #[arg(long = "target", global = true)]
    target: Option<GvkKey>,

    /// Label selector for the managed subset, e.g. "app.kubernetes.io/instance=kyverno"
    #[arg(long = "selector", short = 'l', global = true)]
    selector: Option<LabelSelector>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the background scanner until SIGINT/SIGTERM
    Run {
        /// Seconds between scan ticks
        #[arg(long = "interval-secs")]
        interval_secs: Option<u64>,
        /// Seconds between discovery cache invalidations
        #[arg(long = "discovery-refresh-secs")]
        discovery_refresh_secs: Option<u64>,
        /// Objects processed in parallel per tick
        #[arg(long = "concurrency")]
        concurrency: Option<usize>,
    },
    /// Print the served resource catalog
    Discover,
    /// Run a single scan tick and print its outcomes
    Scan {
        /// Publish Kubernetes Events instead of logging notifications
        #[arg(long = "emit-events", action = ArgAction::SetTrue)]
        emit_events: bool,
    },
    /// List indexed objects matching the selector
    Ls,
    /// Show one indexed object by name
    Get {
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("VAPSCAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VAPSCAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VAPSCAN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Flags win over `VAPSCAN_*` environment values.
fn apply_overrides(mut s: Settings, cli: &Cli) -> Settings {
    if let Some(t) = &cli.target {
        s.target = t.clone();
    }
    if let Some(sel) = &cli.selector {
        s.object_filter = sel.clone();
    }
    if let Commands::Run { interval_secs, discovery_refresh_secs, concurrency } = &cli.command {
        if let Some(secs) = interval_secs {
            s.scan_interval = Duration::from_secs((*secs).max(1));
        }
        if let Some(secs) = discovery_refresh_secs {
            s.discovery_refresh_interval = Duration::from_secs((*secs).max(1));
        }
        if let Some(n) = concurrency {
            s.concurrency = (*n).max(1);
        }
    }
    s
}

fn print_structured<T: Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let settings = apply_overrides(Settings::from_env().context("loading VAPSCAN_* settings")?, &cli);

    match &cli.command {
        Commands::Run { .. } => run(settings).await,
        Commands::Discover => discover(&settings, cli.output).await,
        Commands::Scan { emit_events } => scan_once(&settings, *emit_events, cli.output).await,
        Commands::Ls => ls(&settings, cli.output).await,
        Commands::Get { name } => get(&settings, name, cli.output).await,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = term => info!("received SIGTERM"),
    }
}

fn discovery_cache(client: &kube::Client, settings: &Settings) -> Arc<DiscoveryCache> {
    let provider = Arc::new(KubeCatalogProvider::new(client.clone()));
    Arc::new(DiscoveryCache::new(provider, settings.discovery_refresh_interval))
}

async fn run(settings: Settings) -> Result<()> {
    info!(target_gvk = %settings.target, selector = %settings.object_filter, "starting background scan");
    let client = vapscan_kubehub::connect().await?;
    let cache = discovery_cache(&client, &settings);
    let catalog = cache.get().await.context("initial API discovery")?;
    info!(entries = catalog.len(), "discovery cache primed");
    if catalog.find(&settings.target).is_none() {
        warn!(target_gvk = %settings.target, "target kind is not served; scans will fail until it is");
    }

    let token = CancellationToken::new();
    let poller = cache.spawn_poll(token.clone(), settings.discovery_refresh_interval);

    let (sink, publisher) = KubeEventSink::spawn(client.clone(), settings.reporter.clone(), settings.event_queue_cap);
    let store = Arc::new(KubeObjectStore::new(client, Arc::clone(&cache), settings.target.clone()));
    let sched = Arc::new(ScanScheduler::new(store, Arc::new(RecordScanned), Arc::new(sink), ScanOptions::from(&settings)));
    let mut scan = sched.spawn(token.clone());

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        r = &mut scan => Some(r),
    };
    token.cancel();
    let outcome = match finished {
        Some(r) => r,
        None => scan.await,
    }
    .context("scan task panicked")?;

    let _ = poller.await;
    // The scheduler owns the last sink handle; dropping it lets the publisher drain and exit.
    let ticks = sched.ticks();
    drop(sched);
    let _ = publisher.await;
    info!(ticks, "background scan stopped");

    outcome.map_err(anyhow::Error::from)
}

async fn discover(settings: &Settings, output: Output) -> Result<()> {
    let client = vapscan_kubehub::connect().await?;
    let cache = discovery_cache(&client, settings);
    let catalog = cache.get().await.context("API discovery")?;
    match output {
        Output::Human => {
            for e in catalog.entries.iter() {
                let scope = if e.namespaced { "namespaced" } else { "cluster" };
                println!("{} • {} • {}", e.api_version(), e.kind, scope);
            }
        }
        _ => print_structured(output, &catalog.entries)?,
    }
    Ok(())
}

/// Notification sink that only logs.
struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, n: Notification) {
        match n.event_type {
            EventType::Normal => info!(object = %n.object, reason = %n.reason, "{}", n.message),
            EventType::Warning => warn!(object = %n.object, reason = %n.reason, "{}", n.message),
        }
    }
}

async fn scan_once(settings: &Settings, emit_events: bool, output: Output) -> Result<()> {
    let client = vapscan_kubehub::connect().await?;
    let cache = discovery_cache(&client, settings);
    let store = Arc::new(KubeObjectStore::new(client.clone(), cache, settings.target.clone()));
    let (sink, publisher): (Arc<dyn NotificationSink>, _) = if emit_events {
        let (sink, handle) = KubeEventSink::spawn(client, settings.reporter.clone(), settings.event_queue_cap);
        (Arc::new(sink), Some(handle))
    } else {
        (Arc::new(LogSink), None)
    };
    let sched = ScanScheduler::new(store, Arc::new(RecordScanned), sink, ScanOptions::from(settings));
    let tick = sched.scan_step().await.context("scan tick")?;
    drop(sched);
    if let Some(handle) = publisher {
        let _ = handle.await;
    }
    print_tick(&tick, output)
}

fn print_tick(tick: &ScanTick, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<10} {:<40} MESSAGE", "STATUS", "NAME");
            for o in tick.outcomes.iter() {
                println!("{:<10} {:<40} {}", o.status.as_str(), o.object.name, o.message.as_deref().unwrap_or(""));
            }
            let s = tick.summary();
            println!("{} scanned, {} succeeded, {} failed", tick.candidates.len(), s.succeeded, s.failed);
        }
        _ => print_structured(output, tick)?,
    }
    Ok(())
}

/// Watch the target kind into a local index and wait for its first full listing.
async fn synced_lister(settings: &Settings) -> Result<(Lister<IndexedObject>, CancellationToken, tokio::task::JoinHandle<()>)> {
    let client = vapscan_kubehub::connect().await?;
    let cache = discovery_cache(&client, settings);
    let token = CancellationToken::new();
    let index = Arc::new(ObjectIndex::new());
    let lister = Lister::new(Arc::clone(&index), settings.target.kind.to_lowercase());
    let (tx, rx) = mpsc::channel(settings.event_queue_cap);
    let sync = spawn_sync(index, rx);
    let watcher = tokio::spawn({
        let target = settings.target.clone();
        let selector = settings.object_filter.clone();
        let token = token.clone();
        async move {
            if let Err(e) = vapscan_kubehub::start_watcher(client, cache, &target, &selector, tx, token).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let wait_secs = std::env::var("VAPSCAN_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    while !lister.has_synced() && !watcher.is_finished() {
        if Instant::now() >= deadline {
            warn!(wait_secs, "index not synced before deadline; showing partial results");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let handle = tokio::spawn(async move {
        let _ = watcher.await;
        let _ = sync.await;
    });
    Ok((lister, token, handle))
}

fn creation_timestamp(o: &IndexedObject) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = o.payload.get("metadata")?.get("creationTimestamp")?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&chrono::Utc))
}

fn render_age(created: Option<chrono::DateTime<chrono::Utc>>, now: chrono::DateTime<chrono::Utc>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (now - created).num_seconds().max(0);
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

async fn ls(settings: &Settings, output: Output) -> Result<()> {
    let (lister, token, handle) = synced_lister(settings).await?;
    let mut items = lister.list(&settings.object_filter);
    items.sort_by(|a, b| a.name().cmp(b.name()));
    match output {
        Output::Human => {
            let now = chrono::Utc::now();
            println!("{:<40} AGE", "NAME");
            for o in items.iter() {
                println!("{:<40} {}", o.name(), render_age(creation_timestamp(o), now));
            }
        }
        _ => {
            let payloads: Vec<_> = items.iter().map(|o| &o.payload).collect();
            print_structured(output, &payloads)?;
        }
    }
    token.cancel();
    let _ = handle.await;
    Ok(())
}

async fn get(settings: &Settings, name: &str, output: Output) -> Result<()> {
    let (lister, token, handle) = synced_lister(settings).await?;
    let found = lister.get(name);
    token.cancel();
    let _ = handle.await;
    let o = found?;
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(&o.payload)?),
        _ => print_structured(output, &o.payload)?,
    }
    Ok(())
}
