use anyhow::Result;
use std::time::Duration;

use super::thresholds::{all_passed, ThresholdVerdict};
use super::MetricsSnapshot;

/// Everything a finished run hands to the results sinks.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub snapshot: MetricsSnapshot,
    pub verdicts: Vec<ThresholdVerdict>,
    pub duration: Duration,
    /// Set when the run was stopped by an abort request rather than by the
    /// schedule running out.
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn thresholds_passed(&self) -> bool {
        all_passed(&self.verdicts)
    }

    pub fn exit_status(&self) -> ExitStatus {
        if !self.thresholds_passed() {
            ExitStatus::ThresholdsFailed
        } else if self.aborted.is_some() {
            ExitStatus::Aborted
        } else {
            ExitStatus::Passed
        }
    }
}

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Passed,
    ThresholdsFailed,
    Aborted,
    Fatal,
}

impl ExitStatus {
    pub fn code(&self) -> u8 {
        match self {
            ExitStatus::Passed => 0,
            ExitStatus::Fatal => 1,
            ExitStatus::ThresholdsFailed => 99,
            ExitStatus::Aborted => 105,
        }
    }
}

/// Receives the final report once the run has finished.
pub trait ResultsSink {
    fn publish(&self, report: &RunReport) -> Result<()>;
}
