use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ScheduleStep {
    pub duration: String,
    pub target: usize,
}

/// A threshold entry: either a bare expression or an object with early-abort
/// settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Expression(String),
    Detailed(DetailedThreshold),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct DetailedThreshold {
    pub threshold: String,
    /// Abort the run as soon as this threshold is breached
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// Do not evaluate for early abort before this much time has passed
    #[serde(alias = "delayAbortEval")]
    pub delay_abort_eval: Option<String>,
}

/// Expectations checked against each response. Each becomes a named check.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Expectation {
    pub status: Option<u16>,
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    #[serde(alias = "bodyContains")]
    pub body_contains: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct RequestSpec {
    /// Value of the `name` tag (defaults to the URL)
    pub name: Option<String>,
    /// HTTP method (default: GET)
    pub method: Option<String>,
    /// Absolute URL, or a path joined to `base_url`
    pub url: String,
    pub headers: Option<BTreeMap<String, String>>,
    pub body: Option<String>,
    pub expect: Option<Expectation>,
    /// Group the request's samples are tagged with
    pub group: Option<String>,
    /// Tags added to this request's samples, filterable in thresholds
    pub tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct Config {
    /// Number of concurrent workers (k6: vus)
    #[serde(alias = "vus")]
    pub workers: Option<usize>,
    /// Duration of the test (e.g., "10s", "1m")
    pub duration: Option<String>,
    /// Workers before the first stage (k6: startVUs)
    #[serde(alias = "startVUs")]
    pub start_workers: Option<usize>,
    /// Ramping schedule (k6: stages)
    #[serde(alias = "stages")]
    pub schedule: Option<Vec<ScheduleStep>>,
    /// Fixed number of iterations per worker
    pub iterations: Option<u64>,
    /// Upper bound on run time when only `iterations` is set
    #[serde(alias = "maxDuration")]
    pub max_duration: Option<String>,
    /// Pass/Fail criteria (k6: thresholds)
    #[serde(alias = "thresholds")]
    pub criteria: Option<BTreeMap<String, Vec<ThresholdSpec>>>,
    /// Minimum time per iteration
    #[serde(alias = "minIterationDuration")]
    pub min_iteration_duration: Option<String>,
    /// Graceful shutdown wait time (k6: gracefulStop)
    #[serde(alias = "gracefulStop")]
    pub stop: Option<String>,
    /// Abort the test as soon as any threshold is breached. Individual
    /// thresholds can override this.
    #[serde(alias = "abortOnFail")]
    pub abort_on_fail: Option<bool>,
    /// How often thresholds are checked for early abort (default: 2s)
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Tags added to every sample
    pub tags: Option<BTreeMap<String, String>>,
    /// Target URL to warm up connections before starting
    pub warmup: Option<String>,
    /// Prefix for relative request URLs
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Requests issued in order by every iteration
    pub requests: Option<Vec<RequestSpec>>,
    /// Think time at the end of every iteration (e.g., "1s")
    pub sleep: Option<String>,
}

impl Config {
    /// Load a YAML or JSON plan, picked by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON plan {}", path.display()))?,
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML plan {}", path.display()))?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string()).into()),
        };
        Ok(config)
    }

    /// Apply command-line overrides. Fields set in `overrides` win.
    pub fn merge(&mut self, overrides: Config) {
        // An explicit VU count or duration replaces stages from the file
        let replaces_stages = overrides.schedule.is_none()
            && (overrides.duration.is_some() || overrides.workers.is_some());
        macro_rules! take {
            ($($field:ident),*) => {
                $(if overrides.$field.is_some() { self.$field = overrides.$field; })*
            };
        }
        take!(
            workers,
            duration,
            start_workers,
            schedule,
            iterations,
            max_duration,
            criteria,
            min_iteration_duration,
            stop,
            abort_on_fail,
            threshold_interval,
            tags,
            warmup,
            base_url,
            requests,
            sleep
        );
        if replaces_stages {
            if self.duration.is_none() {
                self.duration = self.stages_total();
            }
            if self.duration.is_some() {
                self.schedule = None;
            }
        }
    }

    /// Combined length of the file's stages, as a duration string.
    fn stages_total(&self) -> Option<String> {
        let total = self
            .schedule
            .as_ref()?
            .iter()
            .try_fold(Duration::ZERO, |acc, step| {
                acc.checked_add(parse_duration_str(&step.duration)?)
            })?;
        Some(format!("{}ms", total.as_millis()))
    }
}
