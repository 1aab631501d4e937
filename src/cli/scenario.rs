//! Scenario built from the `requests` section of a plan file.

use anyhow::Result;
use async_trait::async_trait;
use http::Method;
use std::time::Duration;

use super::config::{Config, RequestSpec};
use crate::engine::{HttpRequest, HttpResponse, Scenario, VuContext};
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Debug, Clone, Default)]
struct Expect {
    status: Option<u16>,
    max_duration: Option<Duration>,
    body_contains: Option<String>,
}

#[derive(Debug, Clone)]
struct Step {
    request: HttpRequest,
    label: String,
    group: Option<String>,
    expect: Expect,
}

/// Issues every configured request in order, checks expectations, then
/// sleeps for the configured think time.
#[derive(Debug, Clone)]
pub struct RequestScenario {
    steps: Vec<Step>,
    think_time: Option<Duration>,
    warmup: Option<String>,
}

fn duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn resolve_url(base: Option<&str>, url: &str) -> String {
    match base {
        Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
            format!("{}/{}", base.trim_end_matches('/'), url.trim_start_matches('/'))
        }
        _ => url.to_string(),
    }
}

fn step(spec: &RequestSpec, base: Option<&str>) -> Result<Step, ConfigError> {
    let method = match &spec.method {
        Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(m.clone()))?,
        None => Method::GET,
    };
    let url = resolve_url(base, &spec.url);
    let mut request = HttpRequest::new(method, url.clone());
    if let Some(headers) = &spec.headers {
        for (k, v) in headers {
            request = request.header(k.as_str(), v.as_str());
        }
    }
    if let Some(body) = &spec.body {
        request = request.body(body.as_str());
    }
    if let Some(name) = &spec.name {
        request = request.name(name.as_str());
    }
    for (k, v) in spec.tags.iter().flatten() {
        request = request.tag(k.as_str(), v.as_str());
    }

    let expect = match &spec.expect {
        Some(e) => Expect {
            status: e.status,
            max_duration: e
                .max_duration
                .as_deref()
                .map(|d| duration("expect.maxDuration", d))
                .transpose()?,
            body_contains: e.body_contains.clone(),
        },
        None => Expect::default(),
    };

    Ok(Step {
        label: spec.name.clone().unwrap_or(url),
        request,
        group: spec.group.clone(),
        expect,
    })
}

impl RequestScenario {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let specs = config.requests.as_deref().unwrap_or_default();
        if specs.is_empty() {
            return Err(ConfigError::NoRequests);
        }
        let base = config.base_url.as_deref();
        let steps = specs
            .iter()
            .map(|s| step(s, base))
            .collect::<Result<Vec<_>, _>>()?;
        let think_time = config
            .sleep
            .as_deref()
            .map(|s| duration("sleep", s))
            .transpose()?;
        Ok(Self {
            steps,
            think_time,
            warmup: config.warmup.as_ref().map(|w| resolve_url(base, w)),
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn run_checks(vu: &VuContext, step: &Step, res: &HttpResponse) -> bool {
    let label = &step.label;
    let mut checks = vu.check(res);
    if let Some(status) = step.expect.status {
        checks = checks.that(&format!("{}: status is {}", label, status), |r| {
            r.status == status
        });
    }
    if let Some(max) = step.expect.max_duration {
        checks = checks.that(
            &format!("{}: duration < {}", label, crate::utils::format_duration(max)),
            |r| r.timings.duration < max,
        );
    }
    if let Some(needle) = &step.expect.body_contains {
        checks = checks.that(&format!("{}: body contains '{}'", label, needle), |r| {
            r.body.contains(needle.as_str())
        });
    }
    checks.passed()
}

#[async_trait]
impl Scenario for RequestScenario {
    type Data = ();

    async fn setup(&self, vu: &mut VuContext) -> Result<()> {
        if let Some(url) = &self.warmup {
            let res = vu.request(HttpRequest::get(url.as_str()).name("warmup")).await;
            match &res.error {
                Some(e) => tracing::warn!(url = %url, error = %e, "warmup request failed"),
                None => tracing::info!(url = %url, status = res.status, "warmup done"),
            }
        }
        Ok(())
    }

    async fn iteration(&self, vu: &mut VuContext, _data: &()) -> Result<()> {
        for step in &self.steps {
            if let Some(group) = &step.group {
                vu.push_group(group);
            }
            let res = vu.request(step.request.clone()).await;
            if !run_checks(vu, step, &res) {
                tracing::debug!(vu = vu.vu_id(), request = %step.label, status = res.status, "expectation failed");
            }
            if step.group.is_some() {
                vu.pop_group();
            }
        }
        if let Some(think) = self.think_time {
            vu.sleep(think).await;
        }
        Ok(())
    }
}
