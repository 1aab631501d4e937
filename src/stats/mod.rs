use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::MetricError;

pub mod csv;
pub mod report;
pub mod snapshot;
pub mod summary;
pub mod thresholds;

pub use report::{ExitStatus, ResultsSink, RunReport};
pub use crate::error::AggregateError;
pub use snapshot::{Aggregator, MetricSeries, MetricsSnapshot};

/// Key/value labels attached to every sample. Ordered so that equal tag sets
/// hash and print identically.
pub type Tags = BTreeMap<String, String>;

/// Names of the metrics the engine records on its own.
pub mod builtin {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_WAITING: &str = "http_req_waiting";
    pub const HTTP_REQ_RECEIVING: &str = "http_req_receiving";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_SENT: &str = "data_sent";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_FAILED: &str = "iteration_failed";
    pub const ITERATIONS_INTERRUPTED: &str = "iterations_interrupted";
    pub const CHECKS: &str = "checks";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
    pub const VUS_CRASHED: &str = "vus_crashed";

    pub const ALL: &[&str] = &[
        HTTP_REQS,
        HTTP_REQ_DURATION,
        HTTP_REQ_WAITING,
        HTTP_REQ_RECEIVING,
        HTTP_REQ_FAILED,
        DATA_SENT,
        DATA_RECEIVED,
        ITERATIONS,
        ITERATION_DURATION,
        ITERATION_FAILED,
        ITERATIONS_INTERRUPTED,
        CHECKS,
        VUS,
        VUS_MAX,
        VUS_CRASHED,
    ];

    pub fn is_builtin(name: &str) -> bool {
        ALL.contains(&name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Running sum.
    Counter,
    /// Share of `true` samples.
    Rate,
    /// Full sample distribution.
    Trend,
    /// Last observed value.
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(s)
    }
}

/// A recorded value plus the index of its tag set in the owning sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Sample {
    pub value: f64,
    pub tag_set: u32,
}

/// Storage for one metric. Tag sets are interned so a sample is 16 bytes no
/// matter how many labels it carries.
#[derive(Debug)]
struct MetricSink {
    kind: MetricKind,
    samples: Vec<Sample>,
    tag_sets: Vec<Tags>,
    tag_index: HashMap<Tags, u32>,
    total: f64,
    last: f64,
}

impl MetricSink {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            samples: Vec::new(),
            tag_sets: Vec::new(),
            tag_index: HashMap::new(),
            total: 0.0,
            last: 0.0,
        }
    }

    fn push(&mut self, value: f64, tags: &Tags) {
        let tag_set = match self.tag_index.get(tags) {
            Some(idx) => *idx,
            None => {
                let idx = self.tag_sets.len() as u32;
                self.tag_sets.push(tags.clone());
                self.tag_index.insert(tags.clone(), idx);
                idx
            }
        };
        self.samples.push(Sample { value, tag_set });
        self.total += value;
        self.last = value;
    }

    fn series(&self) -> MetricSeries {
        MetricSeries::new(self.kind, self.samples.clone(), self.tag_sets.clone())
    }
}

/// Thread-safe store of every metric in one test run.
///
/// The name index is only write-locked when a metric is created. Recording
/// into an existing metric takes the index read lock briefly and then the
/// lock of that single metric, so writers to different metrics never wait
/// on each other.
#[derive(Default)]
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<Mutex<MetricSink>>>>,
}

pub type SharedRegistry = Arc<MetricRegistry>;

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample to `name`, creating the metric as `kind` on first use.
    pub fn record(
        &self,
        name: &str,
        kind: MetricKind,
        value: f64,
        tags: &Tags,
    ) -> Result<(), MetricError> {
        if name.is_empty() {
            return Err(MetricError::EmptyName);
        }

        let existing = self.metrics.read().get(name).cloned();
        let sink = match existing {
            Some(sink) => sink,
            None => self
                .metrics
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(MetricSink::new(kind))))
                .clone(),
        };

        let mut sink = sink.lock();
        if sink.kind != kind {
            return Err(MetricError::KindMismatch {
                name: name.to_string(),
                existing: sink.kind,
                requested: kind,
            });
        }
        sink.push(value, tags);
        Ok(())
    }

    pub fn counter_add(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Counter, value, tags)
    }

    pub fn rate_add(&self, name: &str, hit: bool, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Rate, if hit { 1.0 } else { 0.0 }, tags)
    }

    pub fn trend_add(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Trend, value, tags)
    }

    pub fn gauge_set(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.record(name, MetricKind::Gauge, value, tags)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.metrics.read().get(name).map(|sink| sink.lock().kind)
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every metric into an immutable view. Each metric is locked only
    /// while its own samples are copied.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let sinks: Vec<(String, Arc<Mutex<MetricSink>>)> = self
            .metrics
            .read()
            .iter()
            .map(|(name, sink)| (name.clone(), sink.clone()))
            .collect();
        Self::copy(sinks, elapsed)
    }

    /// Snapshot restricted to `names`. Metrics not listed are not locked.
    pub fn snapshot_of(&self, names: &[&str], elapsed: Duration) -> MetricsSnapshot {
        let sinks: Vec<(String, Arc<Mutex<MetricSink>>)> = {
            let metrics = self.metrics.read();
            names
                .iter()
                .filter_map(|name| metrics.get(*name).map(|sink| (name.to_string(), sink.clone())))
                .collect()
        };
        Self::copy(sinks, elapsed)
    }

    fn copy(sinks: Vec<(String, Arc<Mutex<MetricSink>>)>, elapsed: Duration) -> MetricsSnapshot {
        let metrics = sinks
            .into_iter()
            .map(|(name, sink)| {
                let series = sink.lock().series();
                (name, series)
            })
            .collect();

        MetricsSnapshot::new(elapsed, metrics)
    }

    /// Most recent sample of `name`, without copying the series.
    pub fn latest(&self, name: &str) -> Option<f64> {
        let sink = self.metrics.read().get(name).cloned()?;
        let sink = sink.lock();
        (!sink.samples.is_empty()).then_some(sink.last)
    }

    /// Sum of every sample of `name`, without copying the series.
    pub fn total(&self, name: &str) -> Option<f64> {
        let sink = self.metrics.read().get(name).cloned()?;
        let total = sink.lock().total;
        Some(total)
    }
}

/// Build a tag set from string pairs.
pub fn tags<K, V, I>(pairs: I) -> Tags
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
