//! Immutable metric views and the aggregations computed over them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{MetricKind, Sample, Tags};
use crate::error::AggregateError;

/// How a metric is reduced to a single number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Aggregator {
    Avg,
    Min,
    Max,
    Med,
    Count,
    Rate,
    Value,
    /// Percentile in `0..=100`.
    Percentile(f64),
}

impl Aggregator {
    pub fn supports(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Aggregator::Count | Aggregator::Rate),
            MetricKind::Rate => matches!(self, Aggregator::Rate),
            MetricKind::Trend => matches!(
                self,
                Aggregator::Avg
                    | Aggregator::Min
                    | Aggregator::Max
                    | Aggregator::Med
                    | Aggregator::Count
                    | Aggregator::Percentile(_)
            ),
            MetricKind::Gauge => {
                matches!(self, Aggregator::Value | Aggregator::Min | Aggregator::Max)
            }
        }
    }
}

impl fmt::Display for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregator::Avg => f.write_str("avg"),
            Aggregator::Min => f.write_str("min"),
            Aggregator::Max => f.write_str("max"),
            Aggregator::Med => f.write_str("med"),
            Aggregator::Count => f.write_str("count"),
            Aggregator::Rate => f.write_str("rate"),
            Aggregator::Value => f.write_str("value"),
            Aggregator::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// Copy of one metric's samples at snapshot time.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    kind: MetricKind,
    samples: Vec<Sample>,
    tag_sets: Vec<Tags>,
}

impl MetricSeries {
    pub(crate) fn new(kind: MetricKind, samples: Vec<Sample>, tag_sets: Vec<Tags>) -> Self {
        Self {
            kind,
            samples,
            tag_sets,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn tag_sets(&self) -> &[Tags] {
        &self.tag_sets
    }

    /// Sample values, in recording order, whose tags contain every pair in
    /// `filter`. An empty filter selects everything.
    pub fn values(&self, filter: &Tags) -> Vec<f64> {
        if filter.is_empty() {
            return self.samples.iter().map(|s| s.value).collect();
        }
        let matching: Vec<bool> = self
            .tag_sets
            .iter()
            .map(|set| filter.iter().all(|(k, v)| set.get(k) == Some(v)))
            .collect();
        self.samples
            .iter()
            .filter(|s| matching[s.tag_set as usize])
            .map(|s| s.value)
            .collect()
    }

    pub fn aggregate(
        &self,
        aggregator: &Aggregator,
        filter: &Tags,
        elapsed: Duration,
    ) -> Result<f64, AggregateError> {
        if !aggregator.supports(self.kind) {
            return Err(AggregateError::Unsupported {
                kind: self.kind,
                aggregator: *aggregator,
            });
        }

        let values = self.values(filter);
        if values.is_empty() {
            return Err(AggregateError::NoData);
        }

        let value = match (self.kind, aggregator) {
            (MetricKind::Counter, Aggregator::Count) => values.iter().sum(),
            (MetricKind::Counter, Aggregator::Rate) => {
                if elapsed.is_zero() {
                    return Err(AggregateError::NoData);
                }
                values.iter().sum::<f64>() / elapsed.as_secs_f64()
            }
            (MetricKind::Rate, _) => {
                values.iter().filter(|v| **v != 0.0).count() as f64 / values.len() as f64
            }
            (MetricKind::Gauge, Aggregator::Value) => values[values.len() - 1],
            (_, Aggregator::Count) => values.len() as f64,
            (_, Aggregator::Avg) => values.iter().sum::<f64>() / values.len() as f64,
            (_, Aggregator::Min) => values.iter().copied().fold(f64::INFINITY, f64::min),
            (_, Aggregator::Max) => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            (_, Aggregator::Med) => percentile(&sorted(values), 50.0),
            (_, Aggregator::Percentile(p)) => percentile(&sorted(values), *p),
            _ => {
                return Err(AggregateError::Unsupported {
                    kind: self.kind,
                    aggregator: *aggregator,
                })
            }
        };
        Ok(value)
    }

    /// The values the summary shows for this metric kind.
    pub fn summary_values(&self, elapsed: Duration) -> BTreeMap<String, f64> {
        let aggregators: &[Aggregator] = match self.kind {
            MetricKind::Counter => &[Aggregator::Count, Aggregator::Rate],
            MetricKind::Rate => &[Aggregator::Rate],
            MetricKind::Trend => &[
                Aggregator::Avg,
                Aggregator::Min,
                Aggregator::Med,
                Aggregator::Max,
                Aggregator::Percentile(90.0),
                Aggregator::Percentile(95.0),
                Aggregator::Count,
            ],
            MetricKind::Gauge => &[Aggregator::Value, Aggregator::Min, Aggregator::Max],
        };

        let none = Tags::new();
        let mut out: BTreeMap<String, f64> = aggregators
            .iter()
            .filter_map(|agg| {
                self.aggregate(agg, &none, elapsed)
                    .ok()
                    .map(|v| (agg.to_string(), v))
            })
            .collect();

        if self.kind == MetricKind::Rate {
            let passes = self.samples.iter().filter(|s| s.value != 0.0).count();
            out.insert("passes".to_string(), passes as f64);
            out.insert("fails".to_string(), (self.samples.len() - passes) as f64);
        }
        out
    }
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

/// Linear interpolation between closest ranks over sorted `values`.
/// `p = 100` is the largest sample, `p = 0` the smallest.
fn percentile(values: &[f64], p: f64) -> f64 {
    let n = values.len();
    if n == 1 {
        return values[0];
    }
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return values[lower];
    }
    let weight = rank - lower as f64;
    values[lower] + (values[upper] - values[lower]) * weight
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    elapsed: Duration,
    metrics: BTreeMap<String, MetricSeries>,
}

impl MetricsSnapshot {
    pub(crate) fn new(elapsed: Duration, metrics: BTreeMap<String, MetricSeries>) -> Self {
        Self { elapsed, metrics }
    }

    /// Test time covered by the snapshot; the denominator of counter rates.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn get(&self, name: &str) -> Option<&MetricSeries> {
        self.metrics.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricSeries)> {
        self.metrics.iter()
    }

    pub fn aggregate(
        &self,
        name: &str,
        aggregator: &Aggregator,
        filter: &Tags,
    ) -> Result<f64, AggregateError> {
        self.metrics
            .get(name)
            .ok_or(AggregateError::NoData)?
            .aggregate(aggregator, filter, self.elapsed)
    }
}
