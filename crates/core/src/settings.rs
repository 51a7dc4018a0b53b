//! Runtime settings with defaults, overridable from `VAPSCAN_*` environment variables.

use std::time::Duration;

use tracing::warn;

use crate::{CoreError, GvkKey, LabelSelector};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_DISCOVERY_REFRESH: Duration = Duration::from_secs(60);
pub const DEFAULT_SELECTOR: &str = "app.kubernetes.io/instance=kyverno";
pub const DEFAULT_TARGET: &str = "admissionregistration.k8s.io/v1beta1/ValidatingAdmissionPolicy";
pub const DEFAULT_REPORTER: &str = "kyverno-background-scan";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Period between scan steps.
    pub scan_interval: Duration,
    /// Period between discovery cache invalidations.
    pub discovery_refresh_interval: Duration,
    /// Selector defining the managed object subset.
    pub object_filter: LabelSelector,
    /// Resource kind scanned each tick.
    pub target: GvkKey,
    /// Objects processed in parallel within one tick.
    pub concurrency: usize,
    /// Capacity of the notification queue in front of the event recorder.
    pub event_queue_cap: usize,
    /// Controller name reported on emitted events.
    pub reporter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL,
            discovery_refresh_interval: DEFAULT_DISCOVERY_REFRESH,
            object_filter: LabelSelector::eq("app.kubernetes.io/instance", "kyverno"),
            target: GvkKey {
                group: "admissionregistration.k8s.io".into(),
                version: "v1beta1".into(),
                kind: "ValidatingAdmissionPolicy".into(),
            },
            concurrency: 1,
            event_queue_cap: 1024,
            reporter: DEFAULT_REPORTER.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Load settings from an arbitrary key lookup. Numeric values that fail to
    /// parse fall back to their defaults; selector and target must parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = Self::default();
        if let Some(secs) = parse_num::<u64>(&lookup, "VAPSCAN_SCAN_INTERVAL_SECS") {
            s.scan_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_num::<u64>(&lookup, "VAPSCAN_DISCOVERY_REFRESH_SECS") {
            s.discovery_refresh_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parse_num::<usize>(&lookup, "VAPSCAN_CONCURRENCY") {
            s.concurrency = n.max(1);
        }
        if let Some(n) = parse_num::<usize>(&lookup, "VAPSCAN_EVENT_QUEUE_CAP") {
            s.event_queue_cap = n.max(1);
        }
        if let Some(sel) = lookup("VAPSCAN_SELECTOR") {
            s.object_filter = sel.parse()?;
        }
        if let Some(target) = lookup("VAPSCAN_TARGET") {
            s.target = target.parse()?;
        }
        if let Some(reporter) = lookup("VAPSCAN_REPORTER").filter(|r| !r.trim().is_empty()) {
            s.reporter = reporter;
        }
        Ok(s)
    }
}

fn parse_num<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(s.scan_interval, Duration::from_secs(300));
        assert_eq!(s.object_filter.to_string(), DEFAULT_SELECTOR);
        assert_eq!(s.target.to_string(), DEFAULT_TARGET);
        assert_eq!(s.concurrency, 1);
    }

    #[test]
    fn env_overrides_and_fallbacks() {
        let s = Settings::from_lookup(lookup(&[
            ("VAPSCAN_SCAN_INTERVAL_SECS", "30"),
            ("VAPSCAN_DISCOVERY_REFRESH_SECS", "nope"),
            ("VAPSCAN_CONCURRENCY", "0"),
            ("VAPSCAN_SELECTOR", "team in (a,b)"),
            ("VAPSCAN_TARGET", "v1/ConfigMap"),
        ]))
        .unwrap();
        assert_eq!(s.scan_interval, Duration::from_secs(30));
        assert_eq!(s.discovery_refresh_interval, DEFAULT_DISCOVERY_REFRESH);
        assert_eq!(s.concurrency, 1);
        assert_eq!(s.object_filter.to_string(), "team in (a,b)");
        assert_eq!(s.target.kind, "ConfigMap");
    }

    #[test]
    fn bad_selector_is_an_error() {
        let err = Settings::from_lookup(lookup(&[("VAPSCAN_SELECTOR", "a in (b")])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSelector { .. }));
        for bad in ["env in ()", "a/b/c=x", "-bad-=x"] {
            let err = Settings::from_lookup(lookup(&[("VAPSCAN_SELECTOR", bad)])).unwrap_err();
            assert!(matches!(err, CoreError::InvalidSelector { .. }), "expected error for {:?}", bad);
        }
    }
}
