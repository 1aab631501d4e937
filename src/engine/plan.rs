use std::collections::BTreeMap;
use tokio::time::Duration;

use super::schedule::{Schedule, Stage};
use crate::cli::config::{Config, ThresholdSpec};
use crate::error::ConfigError;
use crate::stats::thresholds::{ThresholdSet, ThresholdSource};
use crate::stats::Tags;
use crate::utils::parse_duration_str;

pub const DEFAULT_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound for plans that only set an iteration count.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);

/// Immutable description of one run.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub schedule: Schedule,
    pub thresholds: ThresholdSet,
    /// Iterations each VU runs before it exits on its own.
    pub iterations: Option<u64>,
    pub min_iteration_duration: Option<Duration>,
    /// How long VUs get to finish their iteration once the run ends.
    pub graceful_stop: Duration,
    /// Reconciliation period of the load controller.
    pub tick: Duration,
    /// Period of abort-on-fail threshold checks.
    pub threshold_interval: Duration,
    /// Tags added to every sample.
    pub tags: Tags,
}

impl TestPlan {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            thresholds: ThresholdSet::default(),
            iterations: None,
            min_iteration_duration: None,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            tick: DEFAULT_TICK,
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            tags: Tags::new(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: ThresholdSet) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = graceful_stop;
        self
    }

    pub fn with_min_iteration_duration(mut self, min: Duration) -> Self {
        self.min_iteration_duration = Some(min);
        self
    }
}

fn duration_field(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn optional_duration(field: &str, value: Option<&String>) -> Result<Option<Duration>, ConfigError> {
    value.map(|v| duration_field(field, v)).transpose()
}

fn threshold_sources(
    criteria: &BTreeMap<String, Vec<ThresholdSpec>>,
    abort_default: bool,
) -> Result<BTreeMap<String, Vec<ThresholdSource>>, ConfigError> {
    let mut out = BTreeMap::new();
    for (metric, specs) in criteria {
        let mut sources = Vec::with_capacity(specs.len());
        for spec in specs {
            let source = match spec {
                ThresholdSpec::Expression(expression) => ThresholdSource {
                    expression: expression.clone(),
                    abort_on_fail: abort_default,
                    delay_abort_eval: None,
                },
                ThresholdSpec::Detailed(d) => ThresholdSource {
                    expression: d.threshold.clone(),
                    abort_on_fail: d.abort_on_fail.unwrap_or(abort_default),
                    delay_abort_eval: optional_duration(
                        "delayAbortEval",
                        d.delay_abort_eval.as_ref(),
                    )?,
                },
            };
            sources.push(source);
        }
        out.insert(metric.clone(), sources);
    }
    Ok(out)
}

impl TryFrom<&Config> for TestPlan {
    type Error = ConfigError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let workers = config.workers.unwrap_or(1);
        let schedule = match (&config.schedule, &config.duration) {
            (Some(steps), _) if !steps.is_empty() => {
                let stages = steps
                    .iter()
                    .map(|s| duration_field("stages", &s.duration).map(|d| Stage::new(d, s.target)))
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                let total = stages
                    .iter()
                    .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration));
                if total.is_none() {
                    return Err(ConfigError::InvalidDuration {
                        field: "stages".to_string(),
                        value: "total of all stages".to_string(),
                    });
                }
                Schedule::new(config.start_workers.unwrap_or(0), stages)
            }
            (_, Some(d)) => Schedule::constant(workers, duration_field("duration", d)?),
            _ if config.iterations.is_some() => {
                let max = optional_duration("maxDuration", config.max_duration.as_ref())?
                    .unwrap_or(DEFAULT_MAX_DURATION);
                Schedule::constant(workers, max)
            }
            _ => return Err(ConfigError::EmptyPlan),
        };

        let thresholds = match &config.criteria {
            Some(criteria) => ThresholdSet::parse(&threshold_sources(
                criteria,
                config.abort_on_fail.unwrap_or(false),
            )?)?,
            None => ThresholdSet::default(),
        };

        let mut plan = TestPlan::new(schedule).with_thresholds(thresholds);
        plan.iterations = config.iterations;
        plan.min_iteration_duration = optional_duration(
            "minIterationDuration",
            config.min_iteration_duration.as_ref(),
        )?;
        if let Some(d) = optional_duration("gracefulStop", config.stop.as_ref())? {
            plan.graceful_stop = d;
        }
        if let Some(d) = optional_duration("thresholdInterval", config.threshold_interval.as_ref())? {
            plan.threshold_interval = d;
        }
        if let Some(tags) = &config.tags {
            plan.tags = tags.clone();
        }
        Ok(plan)
    }
}
