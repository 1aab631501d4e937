//! Error types for the engine.
//!
//! Only setup and teardown failures abort a run. Everything that happens
//! inside an iteration is contained and surfaces through metrics.

use thiserror::Error;

use crate::stats::{Aggregator, MetricKind};

/// Fatal errors returned by [`crate::engine::Engine::run`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("setup failed: {0:#}")]
    Setup(anyhow::Error),

    #[error("teardown failed: {0:#}")]
    Teardown(anyhow::Error),
}

/// Problems turning a configuration into an executable plan.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("plan has no stages and no duration")]
    EmptyPlan,

    #[error("threshold on '{metric}': {source}")]
    Threshold {
        metric: String,
        #[source]
        source: ThresholdError,
    },

    #[error("unsupported plan file extension: {0}")]
    UnsupportedFormat(String),

    #[error("plan defines no requests")]
    NoRequests,

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),
}

/// Metric registry errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("metric '{name}' is a {existing}, cannot record a {requested} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("metric name must not be empty")]
    EmptyName,
}

/// Why a snapshot could not reduce a metric to a number.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    /// The metric was never recorded, or no sample matched the tag filter.
    #[error("no data recorded")]
    NoData,

    #[error("'{aggregator}' is not defined for a {kind} metric")]
    Unsupported {
        kind: MetricKind,
        aggregator: Aggregator,
    },
}

/// Threshold expression parse errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ThresholdError {
    #[error("expression '{0}' has no comparison operator")]
    MissingOperator(String),

    #[error("unknown aggregator '{0}'")]
    UnknownAggregator(String),

    #[error("invalid percentile '{0}', expected a value in 0..=100")]
    InvalidPercentile(String),

    #[error("invalid bound '{0}'")]
    InvalidBound(String),

    #[error("malformed tag filter in '{0}'")]
    InvalidTagFilter(String),
}

/// Returned from an iteration to take the virtual user out of the pool.
///
/// Any other error only fails the current iteration. A `VuCrash` (directly or
/// wrapped in `anyhow::Error`) marks the executor as crashed.
#[derive(Error, Debug)]
#[error("virtual user crashed: {reason}")]
pub struct VuCrash {
    pub reason: String,
}

impl VuCrash {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
