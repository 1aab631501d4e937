use anyhow::{Context, Result};
use std::path::PathBuf;

use super::report::{ResultsSink, RunReport};

/// Flatten the final report into `metric_name,metric_type,value` rows.
pub fn generate_csv(report: &RunReport) -> String {
    let mut out = String::from("metric_name,metric_type,value\n");
    let elapsed = report.snapshot.elapsed();

    for (name, series) in report.snapshot.iter() {
        for (stat, value) in series.summary_values(elapsed) {
            out.push_str(&format!(
                "{}_{},{},{:.3}\n",
                sanitize(name),
                sanitize(&stat),
                series.kind(),
                value
            ));
        }
    }

    for v in &report.verdicts {
        out.push_str(&format!(
            "threshold_{}_{},threshold,{}\n",
            sanitize(&v.metric),
            sanitize(&v.expression),
            u8::from(v.passed)
        ));
    }
    out
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
        .collect()
}

pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultsSink for CsvSink {
    fn publish(&self, report: &RunReport) -> Result<()> {
        std::fs::write(&self.path, generate_csv(report))
            .with_context(|| format!("writing CSV to {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), "CSV export written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::thresholds::ThresholdVerdict;
    use crate::stats::{MetricRegistry, Tags};
    use std::time::Duration;

    #[test]
    fn test_csv_rows() {
        let registry = MetricRegistry::new();
        registry.counter_add("http_reqs", 4.0, &Tags::new()).unwrap();
        registry.trend_add("iteration_duration", 12.5, &Tags::new()).unwrap();
        let report = RunReport {
            snapshot: registry.snapshot(Duration::from_secs(2)),
            verdicts: vec![ThresholdVerdict {
                metric: "http_reqs".to_string(),
                expression: "count>1".to_string(),
                passed: true,
                observed: Some(4.0),
                failure: None,
            }],
            duration: Duration::from_secs(2),
            aborted: None,
        };

        let csv = generate_csv(&report);
        assert!(csv.starts_with("metric_name,metric_type,value\n"));
        assert!(csv.contains("http_reqs_count,counter,4.000\n"));
        assert!(csv.contains("http_reqs_rate,counter,2.000\n"));
        assert!(csv.contains("iteration_duration_p_95_,trend,12.500\n"));
        assert!(csv.contains("threshold_http_reqs_count_1,threshold,1\n"));
    }

    #[test]
    fn test_csv_sink_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let report = RunReport {
            snapshot: MetricRegistry::new().snapshot(Duration::ZERO),
            verdicts: Vec::new(),
            duration: Duration::ZERO,
            aborted: None,
        };
        CsvSink::new(&path).publish(&report).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "metric_name,metric_type,value\n"
        );
    }

    #[test]
    fn test_free_form_names_keep_three_columns() {
        let registry = MetricRegistry::new();
        registry
            .rate_add("status in 200,201", true, &Tags::new())
            .unwrap();
        let report = RunReport {
            snapshot: registry.snapshot(Duration::from_secs(1)),
            verdicts: Vec::new(),
            duration: Duration::from_secs(1),
            aborted: None,
        };
        let csv = generate_csv(&report);
        for line in csv.lines() {
            assert_eq!(line.split(',').count(), 3, "bad row: {}", line);
        }
        assert!(csv.contains("status_in_200_201_fails,rate,0.000"));
    }
}
