//! Metrics.
//!
//! A small in-process registry of labelled counters and bucketed histograms
//! with Prometheus text export, plus [`StoreMetrics`], the facade the router
//! and the instrumented wrapper record into.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric names.
pub mod metrics {
    /// Children built per tenant and resource.
    pub const CHILD_CREATIONS_TOTAL: &str = "trellis_child_creations_total";
    /// Seconds from child creation to its first successful operation.
    pub const FIRST_READY_SECONDS: &str = "trellis_first_ready_seconds";
    /// "(re)initializing" errors per tenant, resource and verb.
    pub const REINITIALIZING_ERRORS_TOTAL: &str = "trellis_reinitializing_errors_total";

    /// Buckets of [`FIRST_READY_SECONDS`].
    pub const FIRST_READY_BUCKETS: &[f64] = &[0.02, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0];
}

/// Label set, sorted by name.
pub type LabelSet = Vec<(String, String)>;

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    let sorted: BTreeMap<&str, &str> = labels.iter().copied().collect();
    sorted
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn render_labels(labels: &LabelSet, extra: Option<(&str, String)>) -> String {
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
        .collect();
    if let Some((k, v)) = extra {
        parts.push(format!("{}=\"{}\"", k, v));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Bucketed histogram.
#[derive(Debug)]
struct Histogram {
    bounds: Vec<f64>,
    /// Non-cumulative bucket counts; the last slot is `+Inf`.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: parking_lot::Mutex<f64>,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: parking_lot::Mutex::new(0.0),
        }
    }

    fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.sum.lock() += value;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, count)| {
                cumulative += count.load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum: *self.sum.lock(),
        }
    }
}

/// Point-in-time view of a histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper bound, cumulative count)` per finite bucket.
    pub buckets: Vec<(f64, u64)>,
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

/// Registry of labelled metrics.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, HashMap<LabelSet, AtomicU64>>>,
    histograms: RwLock<HashMap<String, HashMap<LabelSet, Histogram>>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add(name, labels, 1);
    }

    /// Add to a counter.
    pub fn counter_add(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let key = label_set(labels);
        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(name).and_then(|series| series.get(&key)) {
                counter.fetch_add(value, Ordering::Relaxed);
                return;
            }
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    /// Current counter value (0 if never incremented).
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = label_set(labels);
        self.counters
            .read()
            .get(name)
            .and_then(|series| series.get(&key))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Record a histogram observation. `bounds` is used when the series is new.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], bounds: &[f64], value: f64) {
        let key = label_set(labels);
        {
            let histograms = self.histograms.read();
            if let Some(h) = histograms.get(name).and_then(|series| series.get(&key)) {
                h.observe(value);
                return;
            }
        }
        self.histograms
            .write()
            .entry(name.to_string())
            .or_default()
            .entry(key)
            .or_insert_with(|| Histogram::new(bounds))
            .observe(value);
    }

    /// Snapshot of one histogram series.
    pub fn histogram_get(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        let key = label_set(labels);
        self.histograms
            .read()
            .get(name)
            .and_then(|series| series.get(&key))
            .map(Histogram::snapshot)
    }

    /// Export in Prometheus text format, sorted by name then labels.
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        let counters = self.counters.read();
        let mut names: Vec<&String> = counters.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&format!("# TYPE {} counter\n", name));
            let mut series: Vec<_> = counters[name].iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, value) in series {
                output.push_str(&format!(
                    "{}{} {}\n",
                    name,
                    render_labels(labels, None),
                    value.load(Ordering::Relaxed)
                ));
            }
        }

        let histograms = self.histograms.read();
        let mut names: Vec<&String> = histograms.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&format!("# TYPE {} histogram\n", name));
            let mut series: Vec<_> = histograms[name].iter().collect();
            series.sort_by(|a, b| a.0.cmp(b.0));
            for (labels, histogram) in series {
                let snap = histogram.snapshot();
                for (bound, count) in &snap.buckets {
                    output.push_str(&format!(
                        "{}_bucket{} {}\n",
                        name,
                        render_labels(labels, Some(("le", bound.to_string()))),
                        count
                    ));
                }
                output.push_str(&format!(
                    "{}_bucket{} {}\n",
                    name,
                    render_labels(labels, Some(("le", "+Inf".to_string()))),
                    snap.count
                ));
                output.push_str(&format!(
                    "{}_sum{} {}\n{}_count{} {}\n",
                    name,
                    render_labels(labels, None),
                    snap.sum,
                    name,
                    render_labels(labels, None),
                    snap.count
                ));
            }
        }

        output
    }
}

/// Storage metrics facade.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    registry: MetricsRegistry,
}

impl StoreMetrics {
    /// Create a facade over a fresh registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Underlying registry.
    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    /// A child store was built.
    pub fn record_child_creation(&self, tenant: &str, resource: &str) {
        self.registry.counter_inc(
            metrics::CHILD_CREATIONS_TOTAL,
            &[("tenant", tenant), ("resource", resource)],
        );
    }

    /// A child completed its first successful operation.
    pub fn record_first_ready(&self, tenant: &str, resource: &str, seconds: f64) {
        self.registry.histogram_observe(
            metrics::FIRST_READY_SECONDS,
            &[("tenant", tenant), ("resource", resource)],
            metrics::FIRST_READY_BUCKETS,
            seconds,
        );
    }

    /// A child returned the "(re)initializing" error.
    pub fn record_reinitializing_error(&self, tenant: &str, resource: &str, verb: &str) {
        self.registry.counter_inc(
            metrics::REINITIALIZING_ERRORS_TOTAL,
            &[("tenant", tenant), ("resource", resource), ("verb", verb)],
        );
    }

    /// Children built for a tenant and resource.
    pub fn child_creations(&self, tenant: &str, resource: &str) -> u64 {
        self.registry.counter_get(
            metrics::CHILD_CREATIONS_TOTAL,
            &[("tenant", tenant), ("resource", resource)],
        )
    }

    /// "(re)initializing" errors seen for a tenant, resource and verb.
    pub fn reinitializing_errors(&self, tenant: &str, resource: &str, verb: &str) -> u64 {
        self.registry.counter_get(
            metrics::REINITIALIZING_ERRORS_TOTAL,
            &[("tenant", tenant), ("resource", resource), ("verb", verb)],
        )
    }

    /// First-ready histogram of a tenant and resource.
    pub fn first_ready(&self, tenant: &str, resource: &str) -> Option<HistogramSnapshot> {
        self.registry.histogram_get(
            metrics::FIRST_READY_SECONDS,
            &[("tenant", tenant), ("resource", resource)],
        )
    }

    /// Prometheus text export.
    pub fn export(&self) -> String {
        self.registry.export_prometheus()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_label_set() {
        let registry = MetricsRegistry::new();
        registry.counter_inc("c", &[("tenant", "a"), ("resource", "widgets")]);
        registry.counter_inc("c", &[("resource", "widgets"), ("tenant", "a")]);
        registry.counter_inc("c", &[("tenant", "b"), ("resource", "widgets")]);
        assert_eq!(registry.counter_get("c", &[("tenant", "a"), ("resource", "widgets")]), 2);
        assert_eq!(registry.counter_get("c", &[("tenant", "b"), ("resource", "widgets")]), 1);
        assert_eq!(registry.counter_get("c", &[("tenant", "z")]), 0);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new();
        let labels = [("tenant", "a")];
        for v in [0.01, 0.3, 0.3, 20.0] {
            registry.histogram_observe("h", &labels, metrics::FIRST_READY_BUCKETS, v);
        }
        let snap = registry.histogram_get("h", &labels).unwrap();
        assert_eq!(snap.count, 4);
        assert_eq!(snap.buckets[0], (0.02, 1));
        assert_eq!(snap.buckets[4], (0.5, 3));
        assert_eq!(snap.buckets.last().unwrap().1, 3);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = StoreMetrics::new();
        metrics.record_child_creation("acme", "widgets");
        metrics.record_reinitializing_error("acme", "widgets", "list");
        metrics.record_first_ready("acme", "widgets", 0.07);

        let text = metrics.export();
        assert!(text.contains(
            "trellis_child_creations_total{resource=\"widgets\",tenant=\"acme\"} 1"
        ));
        assert!(text.contains("verb=\"list\""));
        assert!(text.contains("trellis_first_ready_seconds_bucket{resource=\"widgets\",tenant=\"acme\",le=\"0.1\"} 1"));
        assert!(text.contains("le=\"+Inf\""));
    }
}
