//! Metrics collector — per-metric rolling sample buffers.
//!
//! One coarse mutex guards the whole store; no I/O ever happens under it,
//! so hold times stay sub-millisecond even on the routing hot path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use streamfleet_types::{MetricSample, epoch_millis};

/// Hard cap on samples kept per metric, independent of the time window.
const MAX_SAMPLES_PER_METRIC: usize = 10_000;

/// Rolling time-windowed store of numeric samples keyed by metric name.
///
/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Inner>>,
    /// Samples older than this are pruned on every write.
    retention: Duration,
}

struct Inner {
    series: HashMap<String, VecDeque<MetricSample>>,
}

impl MetricsCollector {
    /// Create a collector retaining samples for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                series: HashMap::new(),
            })),
            retention,
        }
    }

    /// Append a sample for `metric`, pruning anything past retention.
    pub fn record(&self, metric: &str, value: f64, source: &str) {
        let now = epoch_millis();
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let buf = inner.series.entry(metric.to_string()).or_default();
        buf.push_back(MetricSample {
            timestamp: now,
            value,
            source: source.to_string(),
        });

        let cutoff = now.saturating_sub(self.retention.as_millis() as u64);
        while let Some(front) = buf.front() {
            if front.timestamp < cutoff || buf.len() > MAX_SAMPLES_PER_METRIC {
                buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// Trailing-window average of `metric`, or `None` with no samples
    /// inside the window.
    pub fn average(&self, metric: &str, window: Duration) -> Option<f64> {
        self.fold_window(metric, window, |values| {
            values.iter().sum::<f64>() / values.len() as f64
        })
    }

    /// Trailing-window maximum of `metric`.
    pub fn max(&self, metric: &str, window: Duration) -> Option<f64> {
        self.fold_window(metric, window, |values| {
            values.iter().cloned().fold(f64::MIN, f64::max)
        })
    }

    /// Most recent sample value of `metric`, regardless of window.
    pub fn latest(&self, metric: &str) -> Option<f64> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .series
            .get(metric)
            .and_then(|buf| buf.back())
            .map(|s| s.value)
    }

    /// Number of retained samples for `metric`.
    pub fn len(&self, metric: &str) -> usize {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.series.get(metric).map(|b| b.len()).unwrap_or(0)
    }

    /// Whether no samples are retained for `metric`.
    pub fn is_empty(&self, metric: &str) -> bool {
        self.len(metric) == 0
    }

    /// Names of all metrics with at least one retained sample.
    pub fn metric_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        inner.series.keys().cloned().collect()
    }

    /// Drop every retained sample.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.series.clear();
        debug!("metrics collector cleared");
    }

    fn fold_window<F>(&self, metric: &str, window: Duration, f: F) -> Option<f64>
    where
        F: FnOnce(Vec<f64>) -> f64,
    {
        let cutoff = epoch_millis().saturating_sub(window.as_millis() as u64);
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let values: Vec<f64> = inner
            .series
            .get(metric)?
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(f(values))
    }
}
