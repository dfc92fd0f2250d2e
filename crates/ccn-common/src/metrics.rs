//! Metrics sink collaborator
//!
//! The core never writes metrics anywhere itself; it hands counters, gauges
//! and histogram samples to a [`MetricsSink`]. Production wiring uses
//! [`FacadeSink`], which forwards to whatever recorder is installed for the
//! `metrics` crate facade.

use dashmap::DashMap;
use std::sync::Arc;

/// Label set attached to a sample
pub type Labels<'a> = &'a [(&'static str, String)];

/// Metrics/log sink
pub trait MetricsSink: Send + Sync {
    /// Add to a monotonic counter
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64);

    /// Set a gauge
    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    /// Record a histogram sample
    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64);
}

fn to_labels(labels: Labels<'_>) -> Vec<::metrics::Label> {
    labels
        .iter()
        .map(|(key, value)| ::metrics::Label::new(*key, value.clone()))
        .collect()
}

/// Forwards to the `metrics` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeSink;

impl MetricsSink for FacadeSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        ::metrics::counter!(name, to_labels(labels)).increment(value);
    }

    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        ::metrics::gauge!(name, to_labels(labels)).set(value);
    }

    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        ::metrics::histogram!(name, to_labels(labels)).record(value);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn increment(&self, _: &'static str, _: Labels<'_>, _: u64) {}
    fn gauge(&self, _: &'static str, _: Labels<'_>, _: f64) {}
    fn histogram(&self, _: &'static str, _: Labels<'_>, _: f64) {}
}

/// In-memory sink (for testing and development)
#[derive(Debug, Default)]
pub struct RecordingSink {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    samples: DashMap<String, Vec<f64>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn series(name: &str, labels: Labels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}{{{}}}", name, rendered.join(","))
    }

    /// Counter total across all label sets
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key() == name || entry.key().starts_with(&format!("{}{{", name)))
            .map(|entry| *entry.value())
            .sum()
    }

    /// Counter value for one exact label set
    pub fn counter_with(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .get(&Self::series(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Last gauge value
    pub fn gauge_value(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.get(&Self::series(name, labels)).map(|v| *v)
    }

    /// Number of histogram samples recorded under `name`
    pub fn sample_count(&self, name: &str) -> usize {
        self.samples
            .iter()
            .filter(|entry| entry.key() == name || entry.key().starts_with(&format!("{}{{", name)))
            .map(|entry| entry.value().len())
            .sum()
    }
}

impl MetricsSink for RecordingSink {
    fn increment(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        *self.counters.entry(Self::series(name, labels)).or_insert(0) += value;
    }

    fn gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges.insert(Self::series(name, labels), value);
    }

    fn histogram(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.samples
            .entry(Self::series(name, labels))
            .or_default()
            .push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.increment("ccn_errors_total", &[("tenant", "acme".into())], 2);
        sink.increment("ccn_errors_total", &[("tenant", "globex".into())], 1);
        sink.gauge("ccn_queue_depth", &[], 7.0);
        sink.histogram("ccn_latency_ms", &[], 12.5);

        assert_eq!(sink.counter("ccn_errors_total"), 3);
        assert_eq!(sink.counter_with("ccn_errors_total", &[("tenant", "acme".into())]), 2);
        assert_eq!(sink.gauge_value("ccn_queue_depth", &[]), Some(7.0));
        assert_eq!(sink.sample_count("ccn_latency_ms"), 1);
    }

    #[test]
    fn test_facade_sink_without_recorder() {
        // No recorder installed: calls are no-ops
        FacadeSink.increment("ccn_test_total", &[("k", "v".into())], 1);
        FacadeSink.gauge("ccn_test_gauge", &[], 1.0);
    }
}
