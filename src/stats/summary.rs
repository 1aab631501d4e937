//! End-of-test summary sinks: console text and JSON.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use std::path::PathBuf;

use super::report::{ResultsSink, RunReport};
use super::{MetricKind, MetricSeries};
use crate::utils::{format_bytes, format_duration, format_millis};

const NAME_WIDTH: usize = 32;

/// Prints the human-readable summary to stdout.
pub struct ConsoleSummary;

impl ResultsSink for ConsoleSummary {
    fn publish(&self, report: &RunReport) -> Result<()> {
        println!("{}", render_text(report));
        Ok(())
    }
}

/// Prints the JSON summary to stdout instead of the text one.
pub struct JsonStdout;

impl ResultsSink for JsonStdout {
    fn publish(&self, report: &RunReport) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(&to_json(report))?);
        Ok(())
    }
}

/// Writes the JSON summary to a file.
pub struct JsonSummary {
    path: PathBuf,
}

impl JsonSummary {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultsSink for JsonSummary {
    fn publish(&self, report: &RunReport) -> Result<()> {
        let body = serde_json::to_string_pretty(&to_json(report))?;
        std::fs::write(&self.path, body)
            .with_context(|| format!("writing summary to {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "summary exported");
        Ok(())
    }
}

fn is_time_metric(name: &str) -> bool {
    name.ends_with("duration") || name.ends_with("waiting") || name.ends_with("receiving")
}

fn is_byte_metric(name: &str) -> bool {
    name.starts_with("data_")
}

fn render_value(name: &str, value: f64) -> String {
    if is_time_metric(name) {
        format_millis(value)
    } else if is_byte_metric(name) {
        format_bytes(value)
    } else if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

fn render_series(name: &str, series: &MetricSeries, report: &RunReport) -> String {
    let values = series.summary_values(report.snapshot.elapsed());
    let get = |k: &str| values.get(k).copied().unwrap_or(0.0);
    match series.kind() {
        MetricKind::Counter => {
            let rate = get("rate");
            if is_byte_metric(name) {
                format!("{} {}/s", format_bytes(get("count")), format_bytes(rate))
            } else {
                format!("{} {:.2}/s", render_value(name, get("count")), rate)
            }
        }
        MetricKind::Rate => format!(
            "{:.2}% ✓ {} ✗ {}",
            get("rate") * 100.0,
            get("passes") as u64,
            get("fails") as u64
        ),
        MetricKind::Trend => ["avg", "min", "med", "max", "p(90)", "p(95)"]
            .iter()
            .map(|k| format!("{}={}", k, render_value(name, get(k))))
            .collect::<Vec<_>>()
            .join(" "),
        MetricKind::Gauge => format!(
            "{} min={} max={}",
            render_value(name, get("value")),
            render_value(name, get("min")),
            render_value(name, get("max"))
        ),
    }
}

/// The text summary printed at the end of a run.
pub fn render_text(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n--- Test Summary ---");

    let mut any = false;
    for (name, series) in report.snapshot.iter() {
        any = true;
        let dots = ".".repeat(NAME_WIDTH.saturating_sub(name.len()));
        let _ = writeln!(
            out,
            "  {}{}: {}",
            name,
            dots,
            render_series(name, series, report)
        );
    }
    if !any {
        let _ = writeln!(out, "No metrics collected.");
    }

    if !report.verdicts.is_empty() {
        let _ = writeln!(out, "\nThresholds:");
        for v in &report.verdicts {
            let mark = if v.passed { "✓" } else { "✗" };
            let detail = match (&v.observed, &v.failure) {
                (Some(obs), _) => format!("observed {:.4}", obs),
                (None, Some(reason)) => reason.to_string(),
                (None, None) => String::new(),
            };
            let _ = writeln!(out, "  {} {} {} ({})", mark, v.metric, v.expression, detail);
        }
    }

    let _ = writeln!(out, "\nDuration: {}", format_duration(report.duration));
    if let Some(reason) = &report.aborted {
        let _ = writeln!(out, "Run aborted: {}", reason);
    }
    let _ = write!(out, "--------------------");
    out
}

/// JSON summary, shaped as `{ state, metrics: { name: { type, values,
/// thresholds } } }`.
pub fn to_json(report: &RunReport) -> Value {
    let elapsed = report.snapshot.elapsed();
    let mut metrics = Map::new();
    for (name, series) in report.snapshot.iter() {
        metrics.insert(
            name.clone(),
            json!({
                "type": series.kind(),
                "values": series.summary_values(elapsed),
            }),
        );
    }

    for v in &report.verdicts {
        let entry = metrics
            .entry(v.metric.clone())
            .or_insert_with(|| json!({}));
        if let Some(obj) = entry.as_object_mut() {
            let thresholds = obj
                .entry("thresholds")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(t) = thresholds.as_object_mut() {
                t.insert(
                    v.expression.clone(),
                    json!({ "ok": v.passed, "observed": v.observed, "failure": v.failure }),
                );
            }
        }
    }

    json!({
        "state": {
            "testRunDurationMs": report.duration.as_secs_f64() * 1000.0,
            "aborted": report.aborted.is_some(),
            "abortReason": report.aborted,
        },
        "thresholdsPassed": report.thresholds_passed(),
        "metrics": metrics,
    })
}
