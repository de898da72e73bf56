//! Invocation metrics.
//!
//! [`Metrics`] is a registry of named counters labelled by VM and application.
//! Every extension engine resolves its four counters once at creation and
//! updates them with atomic operations afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Number of invocation attempts.
pub const INVOCATIONS_TOTAL: &str = "ext_engine_invocations_total";
/// Total wall-clock time spent in invocations.
pub const INVOCATIONS_SECONDS: &str = "ext_engine_invocations_seconds";
/// Number of failed invocation attempts.
pub const ERRORS_TOTAL: &str = "ext_engine_errors_total";
/// Number of instance recoveries after memory overflow.
pub const RECOVERS_TOTAL: &str = "ext_engine_recovers_total";

/// A floating point counter.
#[derive(Debug, Default)]
pub struct MetricValue(AtomicU64);

impl MetricValue {
    /// Add `delta` to the counter.
    pub fn increase(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: &'static str,
    vvm: String,
    app: String,
}

/// One sample of [`Metrics::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub name: String,
    pub vvm: String,
    pub app: String,
    pub value: f64,
}

/// Registry of counters.
#[derive(Debug, Default)]
pub struct Metrics {
    values: DashMap<MetricKey, Arc<MetricValue>>,
}

impl Metrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the counter `name` for the given labels.
    pub fn value(&self, name: &'static str, vvm: &str, app: &str) -> Arc<MetricValue> {
        let key = MetricKey {
            name,
            vvm: vvm.to_string(),
            app: app.to_string(),
        };
        Arc::clone(self.values.entry(key).or_default().value())
    }

    /// Current value of a counter, zero if it was never created.
    pub fn get(&self, name: &str, vvm: &str, app: &str) -> f64 {
        self.values
            .iter()
            .find(|entry| {
                let key = entry.key();
                key.name == name && key.vvm == vvm && key.app == app
            })
            .map_or(0.0, |entry| entry.value().get())
    }

    /// All counters, sorted by name and labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .values
            .iter()
            .map(|entry| MetricSample {
                name: entry.key().name.to_string(),
                vvm: entry.key().vvm.clone(),
                app: entry.key().app.clone(),
                value: entry.value().get(),
            })
            .collect();
        samples.sort_by(|a, b| (&a.name, &a.vvm, &a.app).cmp(&(&b.name, &b.vvm, &b.app)));
        samples
    }
}

/// Counters of one extension engine.
#[derive(Debug, Clone)]
pub(crate) struct EngineMetrics {
    pub invocations_total: Arc<MetricValue>,
    pub invocations_seconds: Arc<MetricValue>,
    pub errors_total: Arc<MetricValue>,
    pub recovers_total: Arc<MetricValue>,
}

impl EngineMetrics {
    pub fn new(metrics: &Metrics, vvm: &str, app: &str) -> Self {
        Self {
            invocations_total: metrics.value(INVOCATIONS_TOTAL, vvm, app),
            invocations_seconds: metrics.value(INVOCATIONS_SECONDS, vvm, app),
            errors_total: metrics.value(ERRORS_TOTAL, vvm, app),
            recovers_total: metrics.value(RECOVERS_TOTAL, vvm, app),
        }
    }
}
