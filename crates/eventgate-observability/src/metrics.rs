//! Metrics sink
//!
//! Counters, gauges and histograms keyed by name + ordered labels,
//! rendered in the Prometheus text exposition format. Metric families
//! are registered lazily on first use and cached; the label-key set
//! for a given name must stay consistent across all samples; a
//! mismatched caller gets a warning and the sample is dropped rather
//! than panicking the producer.
//!
//! The sink owns its own `Registry`, so several sinks can coexist in
//! one process (tests) and `render()` only sees this sink's families.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Fixed histogram bucket boundaries, in seconds.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

struct CounterEntry {
    labels: Vec<String>,
    metric: IntCounterVec,
}

struct GaugeEntry {
    labels: Vec<String>,
    metric: GaugeVec,
}

struct HistogramEntry {
    labels: Vec<String>,
    metric: HistogramVec,
}

/// Name+label keyed metrics over an owned prometheus registry
pub struct MetricsSink {
    registry: Registry,
    namespace: String,
    counters: DashMap<String, CounterEntry>,
    gauges: DashMap<String, GaugeEntry>,
    histograms: DashMap<String, HistogramEntry>,
}

impl MetricsSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            registry: Registry::new(),
            namespace: namespace.into(),
            counters: DashMap::new(),
            gauges: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    /// Add `delta` to a counter.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)], delta: u64) {
        let keys: Vec<String> = labels.iter().map(|(k, _)| (*k).to_string()).collect();
        let metric = match self.counters.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().labels != keys {
                    self.reject_sample(name, &entry.get().labels, &keys);
                    return;
                }
                entry.get().metric.clone()
            }
            Entry::Vacant(entry) => {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let opts = Opts::new(name, name).namespace(self.namespace.clone());
                let metric = match IntCounterVec::new(opts, &key_refs) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(metric = name, error = %e, "Failed to create counter");
                        return;
                    }
                };
                self.register(name, Box::new(metric.clone()));
                entry.insert(CounterEntry {
                    labels: keys,
                    metric: metric.clone(),
                });
                metric
            }
        };
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        metric.with_label_values(&values).inc_by(delta);
    }

    /// Set a gauge to `value`.
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let keys: Vec<String> = labels.iter().map(|(k, _)| (*k).to_string()).collect();
        let metric = match self.gauges.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().labels != keys {
                    self.reject_sample(name, &entry.get().labels, &keys);
                    return;
                }
                entry.get().metric.clone()
            }
            Entry::Vacant(entry) => {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let opts = Opts::new(name, name).namespace(self.namespace.clone());
                let metric = match GaugeVec::new(opts, &key_refs) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(metric = name, error = %e, "Failed to create gauge");
                        return;
                    }
                };
                self.register(name, Box::new(metric.clone()));
                entry.insert(GaugeEntry {
                    labels: keys,
                    metric: metric.clone(),
                });
                metric
            }
        };
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        metric.with_label_values(&values).set(value);
    }

    /// Observe one histogram sample, in seconds.
    pub fn histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let keys: Vec<String> = labels.iter().map(|(k, _)| (*k).to_string()).collect();
        let metric = match self.histograms.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                if entry.get().labels != keys {
                    self.reject_sample(name, &entry.get().labels, &keys);
                    return;
                }
                entry.get().metric.clone()
            }
            Entry::Vacant(entry) => {
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                let opts = HistogramOpts::new(name, name)
                    .namespace(self.namespace.clone())
                    .buckets(DURATION_BUCKETS.to_vec());
                let metric = match HistogramVec::new(opts, &key_refs) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(metric = name, error = %e, "Failed to create histogram");
                        return;
                    }
                };
                self.register(name, Box::new(metric.clone()));
                entry.insert(HistogramEntry {
                    labels: keys,
                    metric: metric.clone(),
                });
                metric
            }
        };
        let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
        metric.with_label_values(&values).observe(value);
    }

    /// Render everything in the text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            warn!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }

    fn register(&self, name: &str, collector: Box<dyn prometheus::core::Collector>) {
        if let Err(e) = self.registry.register(collector) {
            warn!(metric = name, error = %e, "Metric registration failed");
        }
    }

    fn reject_sample(&self, name: &str, existing: &[String], requested: &[String]) {
        warn!(
            metric = name,
            existing = ?existing,
            requested = ?requested,
            "Label set mismatch for metric; sample dropped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counter_render() {
        let sink = MetricsSink::new("eventgate");
        sink.increment(
            "events_routed_total",
            &[("priority", "high"), ("event_type", "purchase")],
            1,
        );
        sink.increment(
            "events_routed_total",
            &[("priority", "high"), ("event_type", "purchase")],
            2,
        );

        let text = sink.render();
        assert!(text.contains("# TYPE eventgate_events_routed_total counter"));
        assert!(text
            .contains(r#"eventgate_events_routed_total{event_type="purchase",priority="high"} 3"#));
    }

    #[test]
    fn test_gauge_overwrites() {
        let sink = MetricsSink::new("eventgate");
        sink.gauge("queue_depth", &[("queue", "events.normal")], 5.0);
        sink.gauge("queue_depth", &[("queue", "events.normal")], 2.0);

        let text = sink.render();
        assert!(text.contains(r#"eventgate_queue_depth{queue="events.normal"} 2"#));
    }

    #[test]
    fn test_histogram_buckets() {
        let sink = MetricsSink::new("eventgate");
        sink.histogram(
            "event_processing_duration_seconds",
            &[("event_type", "click"), ("priority", "1"), ("source", "api")],
            0.03,
        );

        let text = sink.render();
        assert!(text.contains("event_processing_duration_seconds_bucket"));
        assert!(text.contains(r#"le="0.025""#));
        assert!(text.contains("event_processing_duration_seconds_count"));
    }

    #[test]
    fn test_label_mismatch_drops_sample() {
        let sink = MetricsSink::new("eventgate");
        sink.increment("requests_total", &[("path", "/events")], 1);
        // same name with a different label key set: dropped, no panic
        sink.increment("requests_total", &[("method", "POST")], 1);

        let text = sink.render();
        assert!(text.contains(r#"requests_total{path="/events"} 1"#));
        assert!(!text.contains("method"));
    }

    #[test]
    fn test_parallel_producers() {
        let sink = Arc::new(MetricsSink::new("eventgate"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    sink.increment("hits_total", &[("worker", "w")], 1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let text = sink.render();
        assert!(text.contains(r#"eventgate_hits_total{worker="w"} 8000"#));
    }
}
