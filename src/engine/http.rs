//! Pluggable request capability used by virtual users.
//!
//! The engine only needs a method/URL/headers/body in and a
//! status/timings/body out. [`ReqwestTransport`] is the networked
//! implementation; connection pooling, TLS and redirects are reqwest's job.

use async_trait::async_trait;
use http::{HeaderMap, Method};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::stats::{builtin, MetricRegistry, Tags};

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Value of the `name` tag. Defaults to the URL.
    pub name: Option<String>,
    pub timeout: Option<Duration>,
    /// Extra tags on every sample this request records.
    pub tags: Tags,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            name: None,
            timeout: None,
            tags: Tags::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Approximate bytes on the wire: request line, headers and body.
    pub fn wire_size(&self) -> usize {
        let line = self.method.as_str().len() + self.url.len() + 11;
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
        line + headers + 2 + self.body.as_ref().map_or(0, String::len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HttpTimings {
    /// Total time from sending the request to the last body byte.
    pub duration: Duration,
    /// Time to first response byte.
    pub waiting: Duration,
    /// Time spent reading the body.
    pub receiving: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// 0 when no response was received.
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub timings: HttpTimings,
    /// Transport-level failure (timeout, connection refused, ...).
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn network_error(error: impl Into<String>, timings: HttpTimings) -> Self {
        Self {
            error: Some(error.into()),
            timings,
            ..Default::default()
        }
    }

    /// No response, or a 4xx/5xx one.
    pub fn failed(&self) -> bool {
        self.status == 0 || self.status >= 400
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Turn a failed response into an error, for iterations that should
    /// stop at the first bad request.
    pub fn error_for_status(&self) -> anyhow::Result<&Self> {
        match (&self.error, self.failed()) {
            (Some(e), _) => Err(anyhow::anyhow!("request failed: {}", e)),
            (None, true) => Err(anyhow::anyhow!("unexpected status {}", self.status)),
            (None, false) => Ok(self),
        }
    }

    fn wire_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum();
        // status line + headers + blank line + body
        17 + headers + 2 + self.body.len()
    }
}

/// Issues one request. Network failures come back as a response with
/// `status == 0` and `error` set, never as a panic or `Err`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> HttpResponse;
}

pub type SharedTransport = Arc<dyn HttpTransport>;

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("volley/", env!("CARGO_PKG_VERSION")))
            .pool_max_idle_per_host(512)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> HttpResponse {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.as_str());
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                let elapsed = start.elapsed();
                return HttpResponse::network_error(
                    e.to_string(),
                    HttpTimings {
                        duration: elapsed,
                        waiting: elapsed,
                        receiving: Duration::ZERO,
                    },
                );
            }
        };
        let waiting = start.elapsed();
        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let (body, error) = match response.bytes().await {
            Ok(bytes) => (String::from_utf8_lossy(&bytes).into_owned(), None),
            Err(e) => (String::new(), Some(e.to_string())),
        };
        let duration = start.elapsed();

        HttpResponse {
            status,
            headers,
            body,
            timings: HttpTimings {
                duration,
                waiting,
                receiving: duration.saturating_sub(waiting),
            },
            error,
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Record the built-in request metrics for one exchange.
pub(crate) fn record_request(
    registry: &MetricRegistry,
    base: &Tags,
    request: &HttpRequest,
    response: &HttpResponse,
) {
    let mut tags = base.clone();
    tags.extend(request.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
    let name = request
        .name
        .clone()
        .or_else(|| request.tags.get("name").cloned())
        .unwrap_or_else(|| request.url.clone());
    tags.insert("name".to_string(), name);
    tags.insert("method".to_string(), request.method.to_string());
    tags.insert("status".to_string(), response.status.to_string());

    let t = &response.timings;
    let results = [
        registry.counter_add(builtin::HTTP_REQS, 1.0, &tags),
        registry.trend_add(builtin::HTTP_REQ_DURATION, ms(t.duration), &tags),
        registry.trend_add(builtin::HTTP_REQ_WAITING, ms(t.waiting), &tags),
        registry.trend_add(builtin::HTTP_REQ_RECEIVING, ms(t.receiving), &tags),
        registry.rate_add(builtin::HTTP_REQ_FAILED, response.failed(), &tags),
        registry.counter_add(builtin::DATA_SENT, request.wire_size() as f64, &tags),
        registry.counter_add(builtin::DATA_RECEIVED, response.wire_size() as f64, &tags),
    ];
    for e in results.into_iter().filter_map(Result::err) {
        tracing::warn!(error = %e, "failed to record request metric");
    }
}
