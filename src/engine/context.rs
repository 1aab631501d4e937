use tokio::time::Duration;

use super::check::Checks;
use super::control::SharedControl;
use super::http::{record_request, HttpRequest, HttpResponse, SharedTransport};
use crate::error::MetricError;
use crate::stats::{MetricRegistry, SharedRegistry, Tags};

pub const GROUP_SEPARATOR: &str = "::";

/// Per-VU handle passed to every scenario callback.
///
/// Holds the VU's identity, the current group path and the shared
/// collaborators (metric registry, run control, HTTP transport).
pub struct VuContext {
    vu_id: u64,
    iteration: u64,
    groups: Vec<String>,
    registry: SharedRegistry,
    control: SharedControl,
    transport: SharedTransport,
}

impl VuContext {
    pub(crate) fn new(
        vu_id: u64,
        registry: SharedRegistry,
        control: SharedControl,
        transport: SharedTransport,
    ) -> Self {
        Self {
            vu_id,
            iteration: 0,
            groups: Vec::new(),
            registry,
            control,
            transport,
        }
    }

    /// 0 for setup and teardown, 1.. for virtual users.
    pub fn vu_id(&self) -> u64 {
        self.vu_id
    }

    /// Iteration number within this VU, starting at 0.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub(crate) fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    /// `::a::b` for nested groups, empty at the top level.
    pub fn group(&self) -> String {
        self.groups
            .iter()
            .map(|g| format!("{}{}", GROUP_SEPARATOR, g))
            .collect()
    }

    pub fn push_group(&mut self, name: &str) {
        self.groups.push(name.to_string());
    }

    pub fn pop_group(&mut self) -> Option<String> {
        self.groups.pop()
    }

    pub(crate) fn reset_groups(&mut self) {
        self.groups.clear();
    }

    /// Tags applied to samples recorded from this context: run-wide tags
    /// plus the current group.
    pub fn tags(&self) -> Tags {
        let mut tags = (*self.control.tags()).clone();
        let group = self.group();
        if !group.is_empty() {
            tags.insert("group".to_string(), group);
        }
        tags
    }

    pub fn metrics(&self) -> Metrics<'_> {
        Metrics { vu: self }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn check<'a, T: ?Sized>(&'a self, subject: &'a T) -> Checks<'a, T> {
        Checks::new(self, subject)
    }

    /// Send a request and record the built-in HTTP metrics.
    pub async fn request(&self, request: HttpRequest) -> HttpResponse {
        let response = self.transport.send(&request).await;
        if let Some(e) = &response.error {
            tracing::debug!(vu = self.vu_id, url = %request.url, error = %e, "request failed");
        }
        record_request(&self.registry, &self.tags(), &request, &response);
        response
    }

    pub async fn get(&self, url: &str) -> HttpResponse {
        self.request(HttpRequest::get(url)).await
    }

    /// Suspend this VU only.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Whether the run has been asked to stop.
    pub fn is_aborted(&self) -> bool {
        self.control.is_aborted()
    }

    #[cfg(test)]
    pub(crate) fn detached(vu_id: u64) -> Self {
        use super::control::ControlState;
        use super::http::mock::MockTransport;
        use std::sync::Arc;

        Self::new(
            vu_id,
            Arc::new(MetricRegistry::new()),
            Arc::new(ControlState::new()),
            Arc::new(MockTransport::new(200, Duration::ZERO)),
        )
    }
}

/// Custom metric recording with the context's tags merged in.
pub struct Metrics<'a> {
    vu: &'a VuContext,
}

impl Metrics<'_> {
    fn merged(&self, extra: &Tags) -> Tags {
        let mut tags = self.vu.tags();
        tags.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        tags
    }

    pub fn counter_add(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.vu.registry.counter_add(name, value, &self.merged(tags))
    }

    pub fn rate_add(&self, name: &str, hit: bool, tags: &Tags) -> Result<(), MetricError> {
        self.vu.registry.rate_add(name, hit, &self.merged(tags))
    }

    pub fn trend_add(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.vu.registry.trend_add(name, value, &self.merged(tags))
    }

    pub fn gauge_set(&self, name: &str, value: f64, tags: &Tags) -> Result<(), MetricError> {
        self.vu.registry.gauge_set(name, value, &self.merged(tags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{builtin, tags, Aggregator};

    #[test]
    fn test_group_path() {
        let mut vu = VuContext::detached(3);
        assert_eq!(vu.group(), "");
        vu.push_group("checkout");
        vu.push_group("payment");
        assert_eq!(vu.group(), "::checkout::payment");
        assert_eq!(vu.pop_group().as_deref(), Some("payment"));
        assert_eq!(vu.tags().get("group").map(String::as_str), Some("::checkout"));
        vu.pop_group();
        assert!(vu.tags().get("group").is_none());
    }

    #[test]
    fn test_control_tags_are_merged() {
        let vu = VuContext::detached(1);
        vu.control.add_tag("env".to_string(), "staging".to_string());
        vu.metrics()
            .counter_add("orders", 1.0, &tags([("region", "eu")]))
            .unwrap();

        let snap = vu.registry().snapshot(Duration::from_secs(1));
        let series = snap.get("orders").unwrap();
        assert_eq!(series.tag_sets()[0], tags([("env", "staging"), ("region", "eu")]));
    }

    #[test]
    fn test_custom_metric_kind_conflict() {
        let vu = VuContext::detached(1);
        vu.metrics().trend_add("waiting_time", 3.0, &Tags::new()).unwrap();
        assert!(vu.metrics().rate_add("waiting_time", true, &Tags::new()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_records_metrics_in_group() {
        let mut vu = VuContext::detached(1);
        vu.push_group("browse");
        let res = vu.get("http://localhost/products").await;
        assert_eq!(res.status, 200);
        let res = vu.get("http://unreachable/").await;
        assert!(res.failed());

        let snap = vu.registry().snapshot(Duration::from_secs(1));
        let reqs = snap
            .aggregate(builtin::HTTP_REQS, &Aggregator::Count, &tags([("group", "::browse")]))
            .unwrap();
        assert_eq!(reqs, 2.0);
        let failed = snap
            .aggregate(builtin::HTTP_REQ_FAILED, &Aggregator::Rate, &Tags::new())
            .unwrap();
        assert_eq!(failed, 0.5);
    }
}
