//! Pass/fail criteria over aggregated metrics.
//!
//! A threshold is written as `aggregator operator bound`, for example
//! `p(95)<500`, `p95 < 500`, `avg<=300`, `rate<0.01` or `count>100`. The
//! metric key may narrow the samples with a tag filter:
//! `http_req_duration{status:200,method:GET}`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{AggregateError, Aggregator, MetricsSnapshot, Tags};
use crate::error::{ConfigError, ThresholdError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(&self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => (observed - bound).abs() < f64::EPSILON,
            Comparison::Ne => (observed - bound).abs() >= f64::EPSILON,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        };
        f.write_str(s)
    }
}

/// One parsed assertion such as `p(95)<500`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    pub source: String,
    pub aggregator: Aggregator,
    pub comparison: Comparison,
    pub bound: f64,
}

impl ThresholdExpr {
    pub fn parse(source: &str) -> Result<Self, ThresholdError> {
        let trimmed = source.trim();
        let op_start = trimmed
            .find(['<', '>', '=', '!'])
            .ok_or_else(|| ThresholdError::MissingOperator(trimmed.to_string()))?;
        let (lhs, rest) = trimmed.split_at(op_start);

        let (comparison, op_len) = if rest.starts_with("===") {
            (Comparison::Eq, 3)
        } else if rest.starts_with("<=") {
            (Comparison::Le, 2)
        } else if rest.starts_with(">=") {
            (Comparison::Ge, 2)
        } else if rest.starts_with("==") {
            (Comparison::Eq, 2)
        } else if rest.starts_with("!=") {
            (Comparison::Ne, 2)
        } else if rest.starts_with('<') {
            (Comparison::Lt, 1)
        } else if rest.starts_with('>') {
            (Comparison::Gt, 1)
        } else {
            return Err(ThresholdError::MissingOperator(trimmed.to_string()));
        };

        let aggregator = parse_aggregator(lhs.trim())?;
        let bound_str = rest[op_len..].trim();
        let bound = bound_str
            .parse::<f64>()
            .ok()
            .filter(|b| b.is_finite())
            .ok_or_else(|| ThresholdError::InvalidBound(bound_str.to_string()))?;

        Ok(Self {
            source: trimmed.to_string(),
            aggregator,
            comparison,
            bound,
        })
    }
}

fn parse_aggregator(s: &str) -> Result<Aggregator, ThresholdError> {
    let agg = match s {
        "avg" => Aggregator::Avg,
        "min" => Aggregator::Min,
        "max" => Aggregator::Max,
        "med" => Aggregator::Med,
        "count" => Aggregator::Count,
        "rate" => Aggregator::Rate,
        "value" => Aggregator::Value,
        other => {
            let digits = other
                .strip_prefix("p(")
                .and_then(|p| p.strip_suffix(')'))
                .or_else(|| other.strip_prefix('p'))
                .ok_or_else(|| ThresholdError::UnknownAggregator(other.to_string()))?;
            let p = digits
                .trim()
                .parse::<f64>()
                .map_err(|_| ThresholdError::InvalidPercentile(other.to_string()))?;
            if !(0.0..=100.0).contains(&p) {
                return Err(ThresholdError::InvalidPercentile(other.to_string()));
            }
            Aggregator::Percentile(p)
        }
    };
    Ok(agg)
}

/// Split `name{k:v,k2:v2}` into the metric name and its tag filter.
pub fn parse_metric_key(key: &str) -> Result<(String, Tags), ThresholdError> {
    let key = key.trim();
    let Some(open) = key.find('{') else {
        if key.is_empty() || key.contains('}') {
            return Err(ThresholdError::InvalidTagFilter(key.to_string()));
        }
        return Ok((key.to_string(), Tags::new()));
    };

    let name = key[..open].trim();
    let body = key[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| ThresholdError::InvalidTagFilter(key.to_string()))?;
    if name.is_empty() {
        return Err(ThresholdError::InvalidTagFilter(key.to_string()));
    }

    let mut filter = Tags::new();
    for pair in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| ThresholdError::InvalidTagFilter(key.to_string()))?;
        filter.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok((name.to_string(), filter))
}

/// A threshold bound to a metric, with its early-abort settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Key as written in the plan, including any tag filter.
    pub key: String,
    pub metric: String,
    pub filter: Tags,
    pub expr: ThresholdExpr,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// The observed value did not satisfy the comparison.
    Breached,
    /// Nothing was recorded for the metric (or its tag filter).
    NoData,
    /// The aggregator is not defined for the metric's kind.
    Unsupported { detail: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Breached => f.write_str("threshold breached"),
            FailureReason::NoData => f.write_str("no data: no samples recorded for this metric or tag filter"),
            FailureReason::Unsupported { detail } => f.write_str(detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    pub metric: String,
    pub expression: String,
    pub passed: bool,
    pub observed: Option<f64>,
    pub failure: Option<FailureReason>,
}

/// Every threshold of a plan, in a stable order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    thresholds: Vec<Threshold>,
}

/// Settings of a single threshold entry before parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSource {
    pub expression: String,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

impl ThresholdSet {
    pub fn parse(spec: &BTreeMap<String, Vec<ThresholdSource>>) -> Result<Self, ConfigError> {
        let mut thresholds = Vec::new();
        for (key, sources) in spec {
            let wrap = |source| ConfigError::Threshold {
                metric: key.clone(),
                source,
            };
            let (metric, filter) = parse_metric_key(key).map_err(wrap)?;
            for src in sources {
                let expr = ThresholdExpr::parse(&src.expression).map_err(wrap)?;
                thresholds.push(Threshold {
                    key: key.clone(),
                    metric: metric.clone(),
                    filter: filter.clone(),
                    expr,
                    abort_on_fail: src.abort_on_fail,
                    delay_abort_eval: src.delay_abort_eval,
                });
            }
        }
        Ok(Self { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.thresholds.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Threshold> {
        self.thresholds.iter()
    }

    /// Metrics read by [`ThresholdSet::checkpoint`], without duplicates.
    pub fn abortable_metrics(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .map(|t| t.metric.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Final verdicts for every threshold.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<ThresholdVerdict> {
        self.thresholds
            .iter()
            .map(|t| evaluate_one(t, snapshot))
            .collect()
    }

    /// Mid-run check. Returns the first abortable threshold that is breached,
    /// ignoring metrics that have not produced data yet.
    pub fn checkpoint(&self, snapshot: &MetricsSnapshot) -> Option<ThresholdVerdict> {
        self.thresholds
            .iter()
            .filter(|t| t.abort_on_fail)
            .filter(|t| t.delay_abort_eval.map_or(true, |d| snapshot.elapsed() >= d))
            .map(|t| evaluate_one(t, snapshot))
            .find(|v| !v.passed && v.failure != Some(FailureReason::NoData))
    }
}

fn evaluate_one(threshold: &Threshold, snapshot: &MetricsSnapshot) -> ThresholdVerdict {
    let result = snapshot.aggregate(
        &threshold.metric,
        &threshold.expr.aggregator,
        &threshold.filter,
    );
    let (passed, observed, failure) = match result {
        Ok(value) => {
            let ok = threshold.expr.comparison.holds(value, threshold.expr.bound);
            (ok, Some(value), (!ok).then_some(FailureReason::Breached))
        }
        Err(AggregateError::NoData) => (false, None, Some(FailureReason::NoData)),
        Err(e @ AggregateError::Unsupported { .. }) => (
            false,
            None,
            Some(FailureReason::Unsupported {
                detail: e.to_string(),
            }),
        ),
    };

    ThresholdVerdict {
        metric: threshold.key.clone(),
        expression: threshold.expr.source.clone(),
        passed,
        observed,
        failure,
    }
}

pub fn all_passed(verdicts: &[ThresholdVerdict]) -> bool {
    verdicts.iter().all(|v| v.passed)
}
