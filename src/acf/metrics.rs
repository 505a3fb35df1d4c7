//! C2 — Metrics Registry.
//!
//! Counters, gauges, histograms and summaries over label tuples, with sliding-window
//! aggregation and a Prometheus text-format exporter. Grounded on
//! `examples/original_source/backend/agents/monitoring/metrics_collector.py`
//! (`MetricsCollector`/`MetricSeries`), re-expressed with `parking_lot::RwLock` in place
//! of the Python GIL-protected dicts and `chrono::DateTime<Utc>` in place of
//! `datetime.now(UTC)`.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Rate,
    P50,
    P95,
    P99,
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    pub description: String,
    pub kind: MetricKind,
    pub unit: String,
    pub labels: Vec<String>,
    /// Monotonic upper bounds for histogram buckets; empty for non-histogram metrics.
    pub buckets: Vec<f64>,
}

impl Metric {
    pub fn counter(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind: MetricKind::Counter,
            unit: String::new(),
            labels: Vec::new(),
            buckets: Vec::new(),
        }
    }

    pub fn gauge(name: &str, description: &str) -> Self {
        Self {
            kind: MetricKind::Gauge,
            ..Self::counter(name, description)
        }
    }

    pub fn histogram(name: &str, description: &str, buckets: Vec<f64>) -> Self {
        Self {
            kind: MetricKind::Histogram,
            buckets,
            ..Self::counter(name, description)
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

#[derive(Debug, Clone)]
struct PointValue {
    value: f64,
    instant: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MetricSeries {
    values: Vec<PointValue>,
    /// Cumulative `le` bucket counts, keyed by upper bound.
    histogram_counts: Vec<(f64, u64)>,
    sum: f64,
    count: u64,
}

impl MetricSeries {
    fn add_value(&mut self, value: f64, instant: DateTime<Utc>, buckets: &[f64]) {
        self.values.push(PointValue { value, instant });
        self.sum += value;
        self.count += 1;

        if !buckets.is_empty() {
            if self.histogram_counts.is_empty() {
                self.histogram_counts = buckets.iter().map(|b| (*b, 0)).collect();
            }
            for (bound, count) in self.histogram_counts.iter_mut() {
                if value <= *bound {
                    *count += 1;
                }
            }
        }
    }

    fn windowed(&self, now: DateTime<Utc>, window_seconds: i64) -> Vec<f64> {
        let cutoff = now - chrono::Duration::seconds(window_seconds);
        self.values
            .iter()
            .filter(|p| p.instant >= cutoff)
            .map(|p| p.value)
            .collect()
    }

    fn retain_since(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.values.len();
        self.values.retain(|p| p.instant >= cutoff);
        before - self.values.len()
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * pct / 100.0) as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}

fn aggregate(values: &[f64], aggregation: Aggregation, window_seconds: i64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    match aggregation {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Count => values.len() as f64,
        Aggregation::Rate => {
            if window_seconds <= 0 {
                0.0
            } else {
                values.len() as f64 / window_seconds as f64
            }
        }
        Aggregation::P50 | Aggregation::P95 | Aggregation::P99 => {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let pct = match aggregation {
                Aggregation::P50 => 50.0,
                Aggregation::P95 => 95.0,
                _ => 99.0,
            };
            percentile(&sorted, pct)
        }
    }
}

/// Renders the `{k="v",...}` Prometheus label suffix, appending `extra` (e.g. a
/// histogram bucket's `le` bound) after the series' own labels. Empty when there are
/// no labels to render at all.
fn render_labels(pairs: &[(&str, &str)], extra: Option<(&str, &str)>) -> String {
    let mut all: Vec<(&str, &str)> = pairs.to_vec();
    if let Some(e) = extra {
        all.push(e);
    }
    if all.is_empty() {
        return String::new();
    }
    let body = all
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

fn label_key(labels: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(&str, &str)> = labels.to_vec();
    pairs.sort_by_key(|(k, _)| *k);
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

type CallbackFn = Box<dyn Fn(&str, f64, &[(String, String)]) + Send + Sync>;

struct Inner {
    metrics: HashMap<String, Metric>,
    series: HashMap<String, HashMap<String, MetricSeries>>,
    callbacks: Vec<CallbackFn>,
}

/// Sliding-window metrics registry. Thread-safe; `increment`/`set`/`observe` never block
/// longer than a single lock acquisition and never allocate unbounded memory (the ring is
/// bounded by `retention_hours`, enforced by `cleanup`).
pub struct MetricsRegistry {
    inner: RwLock<Inner>,
    retention_hours: i64,
    clock: Box<dyn Clock>,
}

impl MetricsRegistry {
    pub fn new(retention_hours: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                metrics: HashMap::new(),
                series: HashMap::new(),
                callbacks: Vec::new(),
            }),
            retention_hours: retention_hours as i64,
            clock: Box::new(SystemClock),
        }
    }

    #[cfg(test)]
    pub fn with_clock(retention_hours: u64, clock: Box<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                metrics: HashMap::new(),
                series: HashMap::new(),
                callbacks: Vec::new(),
            }),
            retention_hours: retention_hours as i64,
            clock,
        }
    }

    pub fn register(&self, metric: Metric) {
        let mut inner = self.inner.write();
        inner.series.entry(metric.name.clone()).or_default();
        inner.metrics.insert(metric.name.clone(), metric);
    }

    pub fn add_callback(&self, callback: CallbackFn) {
        self.inner.write().callbacks.push(callback);
    }

    fn record(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let now = self.clock.now();
        let key = label_key(labels);

        let buckets = {
            let inner = self.inner.read();
            inner
                .metrics
                .get(name)
                .map(|m| m.buckets.clone())
                .unwrap_or_default()
        };

        {
            let mut inner = self.inner.write();
            let series_map = inner.series.entry(name.to_string()).or_default();
            let series = series_map.entry(key).or_default();
            series.add_value(value, now, &buckets);
        }

        let owned_labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let guard = self.inner.read();
        for cb in guard.callbacks.iter() {
            cb(name, value, &owned_labels);
        }
    }

    pub fn increment(&self, name: &str, delta: f64, labels: &[(&str, &str)]) {
        self.record(name, delta, labels);
    }

    pub fn set(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.record(name, value, labels);
    }

    pub fn observe(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.record(name, value, labels);
    }

    /// Aggregate across all label combinations of `name` if `labels` does not match an
    /// exact series key, mirroring the Python fallback in `MetricsCollector.get`.
    pub fn get(
        &self,
        name: &str,
        labels: &[(&str, &str)],
        aggregation: Aggregation,
        window_seconds: i64,
    ) -> f64 {
        let now = self.clock.now();
        let inner = self.inner.read();
        let Some(series_map) = inner.series.get(name) else {
            return 0.0;
        };

        let key = label_key(labels);
        if let Some(series) = series_map.get(&key) {
            return aggregate(&series.windowed(now, window_seconds), aggregation, window_seconds);
        }

        let mut combined = Vec::new();
        for series in series_map.values() {
            combined.extend(series.windowed(now, window_seconds));
        }
        aggregate(&combined, aggregation, window_seconds)
    }

    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::hours(self.retention_hours);
        let mut removed = 0;
        let mut inner = self.inner.write();
        for series_map in inner.series.values_mut() {
            for series in series_map.values_mut() {
                removed += series.retain_since(cutoff);
            }
        }
        removed
    }

    /// Renders Prometheus text exposition format: `# HELP`/`# TYPE` per metric, then
    /// cumulative `_bucket{le=...}` lines for histograms or a single latest-value line
    /// otherwise, matching `export_prometheus` in the Python original.
    pub fn export_text_line_protocol(&self, namespace: &str) -> String {
        let inner = self.inner.read();
        let mut out = String::new();

        let mut names: Vec<&String> = inner.metrics.keys().collect();
        names.sort();

        for name in names {
            let metric = &inner.metrics[name];
            let full_name = format!("{namespace}_{name}");
            let type_str = match metric.kind {
                MetricKind::Counter => "counter",
                MetricKind::Gauge => "gauge",
                MetricKind::Histogram => "histogram",
                MetricKind::Summary => "summary",
            };
            let _ = writeln!(out, "# HELP {full_name} {}", metric.description);
            let _ = writeln!(out, "# TYPE {full_name} {type_str}");

            let Some(series_map) = inner.series.get(name) else {
                continue;
            };

            for (key, series) in series_map.iter() {
                let pairs: Vec<(&str, &str)> = if key.is_empty() {
                    Vec::new()
                } else {
                    key.split(',')
                        .map(|kv| {
                            let mut parts = kv.splitn(2, '=');
                            (parts.next().unwrap_or(""), parts.next().unwrap_or(""))
                        })
                        .collect()
                };
                let label_suffix = render_labels(&pairs, None);

                if metric.kind == MetricKind::Histogram {
                    let mut sorted_buckets = series.histogram_counts.clone();
                    sorted_buckets.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                    for (bound, count) in sorted_buckets {
                        let bound_str = bound.to_string();
                        let bound_label = render_labels(&pairs, Some(("le", bound_str.as_str())));
                        let _ = writeln!(out, "{full_name}_bucket{bound_label} {count}");
                    }
                    let _ = writeln!(out, "{full_name}_sum{label_suffix} {}", series.sum);
                    let _ = writeln!(out, "{full_name}_count{label_suffix} {}", series.count);
                } else if let Some(last) = series.values.last() {
                    let _ = writeln!(out, "{full_name}{label_suffix} {}", last.value);
                }
            }
        }

        out
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        let now = self.clock.now();
        let inner = self.inner.read();
        let mut out = HashMap::new();
        for (name, series_map) in inner.series.iter() {
            let mut total = Vec::new();
            for series in series_map.values() {
                total.extend(series.windowed(now, 60));
            }
            out.insert(name.clone(), aggregate(&total, Aggregation::Sum, 60));
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new(24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    #[test]
    fn counter_sums_across_window() {
        let registry = MetricsRegistry::new(24);
        registry.register(Metric::counter("requests_total", "total requests"));
        registry.increment("requests_total", 1.0, &[]);
        registry.increment("requests_total", 2.0, &[]);
        let total = registry.get("requests_total", &[], Aggregation::Sum, 3600);
        assert_eq!(total, 3.0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new(24);
        registry.register(Metric::histogram(
            "latency_ms",
            "latency",
            vec![100.0, 500.0, 1000.0],
        ));
        registry.observe("latency_ms", 50.0, &[]);
        registry.observe("latency_ms", 400.0, &[]);
        registry.observe("latency_ms", 2000.0, &[]);

        let text = registry.export_text_line_protocol("ai_agent");
        assert!(text.contains("ai_agent_latency_ms_bucket{le=\"100\"} 1"));
        assert!(text.contains("ai_agent_latency_ms_bucket{le=\"500\"} 2"));
        assert!(text.contains("ai_agent_latency_ms_bucket{le=\"1000\"} 2"));
        assert!(text.contains("ai_agent_latency_ms_count 3"));
    }

    #[test]
    fn export_does_not_panic_for_counters_and_gauges() {
        let registry = MetricsRegistry::new(24);
        registry.register(Metric::counter("requests_total", "total requests"));
        registry.register(Metric::gauge("mem_bytes", "memory"));
        registry.increment("requests_total", 1.0, &[]);
        registry.increment("requests_total", 2.0, &[]);
        registry.set("mem_bytes", 42.0, &[]);

        let text = registry.export_text_line_protocol("ai_agent");
        assert!(text.contains("ai_agent_requests_total 2"));
        assert!(text.contains("ai_agent_mem_bytes 42"));
    }

    #[test]
    fn cleanup_drops_points_past_retention() {
        let clock = FixedClock(Utc::now());
        let registry = MetricsRegistry::with_clock(1, Box::new(clock));
        registry.register(Metric::gauge("mem_bytes", "memory"));
        registry.set("mem_bytes", 10.0, &[]);
        // Nothing to remove yet, same instant.
        assert_eq!(registry.cleanup(), 0);
    }
}
