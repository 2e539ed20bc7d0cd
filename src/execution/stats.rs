/// Operator statistics
///
/// Provides per-operator counters:
/// - Named long/double metrics keyed by a `MetricDef`
/// - Wait time (time blocked on tunnels or runtime filters)
/// - Batches and records processed
///
/// Counters are shared between an operator and its worker threads, so every
/// field is either atomic or a concurrent map.
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A named operator metric
pub trait MetricDef {
    fn metric_name(&self) -> &'static str;
}

/// Counters for one operator instance
#[derive(Debug)]
pub struct OperatorStats {
    /// Operator name used in log lines
    operator: String,

    /// Integer metrics
    long_metrics: DashMap<&'static str, i64>,

    /// Floating point metrics
    double_metrics: DashMap<&'static str, f64>,

    /// Time spent blocked (nanoseconds)
    wait_nanos: AtomicU64,

    batches: AtomicU64,
    records: AtomicU64,
}

impl OperatorStats {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            long_metrics: DashMap::new(),
            double_metrics: DashMap::new(),
            wait_nanos: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            records: AtomicU64::new(0),
        }
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn add_long_stat(&self, metric: &dyn MetricDef, value: i64) {
        *self.long_metrics.entry(metric.metric_name()).or_insert(0) += value;
    }

    pub fn set_long_stat(&self, metric: &dyn MetricDef, value: i64) {
        self.long_metrics.insert(metric.metric_name(), value);
    }

    /// Current value, 0 if never recorded
    pub fn long_stat(&self, metric: &dyn MetricDef) -> i64 {
        self.long_metrics
            .get(metric.metric_name())
            .map_or(0, |v| *v)
    }

    pub fn set_double_stat(&self, metric: &dyn MetricDef, value: f64) {
        self.double_metrics.insert(metric.metric_name(), value);
    }

    pub fn double_stat(&self, metric: &dyn MetricDef) -> f64 {
        self.double_metrics
            .get(metric.metric_name())
            .map_or(0.0, |v| *v)
    }

    /// Record one batch of `records` rows
    pub fn record_batch(&self, records: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn add_wait(&self, elapsed: Duration) {
        self.wait_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Run `f`, counting its duration as wait time
    pub fn time_wait<T>(&self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.add_wait(start.elapsed());
        result
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_nanos.load(Ordering::Relaxed))
    }

    /// Fold another instance's counters into this one (long metrics are summed)
    pub fn merge_metrics(&self, other: &OperatorStats) {
        for entry in other.long_metrics.iter() {
            *self.long_metrics.entry(*entry.key()).or_insert(0) += *entry.value();
        }
        for entry in other.double_metrics.iter() {
            *self.double_metrics.entry(*entry.key()).or_insert(0.0) += *entry.value();
        }
        self.wait_nanos
            .fetch_add(other.wait_nanos.load(Ordering::Relaxed), Ordering::Relaxed);
        self.batches.fetch_add(other.batches(), Ordering::Relaxed);
        self.records.fetch_add(other.records(), Ordering::Relaxed);
    }

    /// Sorted copy of the long metrics for reporting
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.long_metrics
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect()
    }
}
