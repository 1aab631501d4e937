//! Named boolean assertions recorded per iteration.
//!
//! Checks are observational. A failing (or panicking) predicate is recorded
//! and reported back to the caller, but never stops the iteration.

use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::context::VuContext;
use crate::stats::builtin;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
}

/// Builder returned by [`VuContext::check`].
///
/// ```ignore
/// let ok = vu
///     .check(&res)
///     .that("status is 200", |r| r.status == 200)
///     .that("body not empty", |r| !r.body.is_empty())
///     .passed();
/// ```
pub struct Checks<'a, T: ?Sized> {
    vu: &'a VuContext,
    subject: &'a T,
    results: Vec<CheckResult>,
}

impl<'a, T: ?Sized> Checks<'a, T> {
    pub(crate) fn new(vu: &'a VuContext, subject: &'a T) -> Self {
        Self {
            vu,
            subject,
            results: Vec::new(),
        }
    }

    /// Evaluate one predicate against the subject and record the result.
    pub fn that<F>(mut self, name: &str, predicate: F) -> Self
    where
        F: FnOnce(&T) -> bool,
    {
        let subject = self.subject;
        let passed = catch_unwind(AssertUnwindSafe(|| predicate(subject))).unwrap_or(false);
        self.record(name, passed);
        self
    }

    fn record(&mut self, name: &str, passed: bool) {
        let mut tags = self.vu.tags();
        tags.insert("check".to_string(), name.to_string());

        let metrics = self.vu.metrics();
        if let Err(e) = metrics.rate_add(builtin::CHECKS, passed, &tags) {
            tracing::warn!(check = name, error = %e, "failed to record check");
        }
        if let Some(metric) = check_metric_name(name) {
            if let Err(e) = metrics.rate_add(&metric, passed, &tags) {
                tracing::warn!(check = name, error = %e, "failed to record check");
            }
        }

        self.results.push(CheckResult {
            name: name.to_string(),
            passed,
            timestamp: Utc::now(),
        });
    }

    /// `true` when every predicate so far passed.
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<CheckResult> {
        self.results
    }
}

/// Name of the per-check Rate metric. A check named `checks` only feeds the
/// built-in; other built-in names get a `check_` prefix.
fn check_metric_name(name: &str) -> Option<String> {
    match name {
        builtin::CHECKS => None,
        n if builtin::is_builtin(n) => Some(format!("check_{}", n)),
        n => Some(n.to_string()),
    }
}
