//! Validation reports and the validation engine seam
//!
//! Every validator contributes `CheckResult`s, violations, cycles, and
//! typed failures into one `ValidationReport`; `ok ⇔ blocking_count == 0`.
//! The kernel consumes validation through the `ValidationEngine` trait so
//! orchestration logic never depends on subprocess details.

pub mod heavy;
pub mod light;
pub mod v1;

use crate::contract::ExecutionConfig;
use crate::failures::ValidationFailure;
use crate::findings::Violation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Outcome of one sub-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pass => write!(f, "pass"),
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// One sub-check's result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub id: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl CheckResult {
    pub fn pass(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CheckStatus::Pass,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn fail(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CheckStatus::Fail,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn skip(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: CheckStatus::Skip,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Combined validation outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub violations: Vec<Violation>,
    pub cycles: Vec<Vec<String>>,
    pub failures: Vec<ValidationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn add_check(&mut self, check: CheckResult) {
        tracing::debug!(check = %check.id, status = %check.status, "validation check");
        self.checks.push(check);
    }

    pub fn add_violations(&mut self, violations: Vec<Violation>) {
        self.violations.extend(violations);
        self.violations = crate::findings::sort_and_dedup(std::mem::take(&mut self.violations));
    }

    pub fn add_failures(&mut self, failures: Vec<ValidationFailure>) {
        self.failures.extend(failures);
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.checks.extend(other.checks);
        self.add_violations(other.violations);
        self.cycles.extend(other.cycles);
        self.failures.extend(other.failures);
    }

    pub fn finalize(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Failed checks + blocking violations + cycles.
    pub fn blocking_count(&self) -> usize {
        let failed_checks = self
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count();
        let blocking_violations = self.violations.iter().filter(|v| v.is_blocking()).count();
        failed_checks + blocking_violations + self.cycles.len()
    }

    pub fn warning_count(&self) -> usize {
        self.violations.iter().filter(|v| !v.is_blocking()).count()
    }

    pub fn ok(&self) -> bool {
        self.blocking_count() == 0
    }

    /// Ids of checks with a fail status, in order.
    pub fn failed_check_ids(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Compact one-line summary for logging.
    pub fn summary(&self) -> String {
        let statuses: Vec<String> = self
            .checks
            .iter()
            .map(|c| format!("{}:{}", c.id, c.status))
            .collect();
        format!(
            "[{}] blocking={} warnings={} [{}]",
            if self.ok() { "PASS" } else { "FAIL" },
            self.blocking_count(),
            self.warning_count(),
            statuses.join(" ")
        )
    }
}

/// The validation capability the kernel consumes.
#[async_trait]
pub trait ValidationEngine: Send + Sync {
    async fn validate(&self, worktree_root: &Path, config: &ExecutionConfig) -> ValidationReport;
}

/// The production engine: light checks plus the heavy pipeline when the
/// contract enables it.
pub struct DefaultValidationEngine {
    pub arch_contract: crate::arch::ArchContract,
    pub heavy_options: heavy::HeavyOptions,
}

impl Default for DefaultValidationEngine {
    fn default() -> Self {
        Self {
            arch_contract: crate::arch::ArchContract::default(),
            heavy_options: heavy::HeavyOptions::default(),
        }
    }
}

#[async_trait]
impl ValidationEngine for DefaultValidationEngine {
    async fn validate(&self, worktree_root: &Path, config: &ExecutionConfig) -> ValidationReport {
        let mut report = ValidationReport::new();
        report.worktree_path = Some(worktree_root.display().to_string());

        if !config.light_validation_mode.is_off() {
            report.merge(light::run_light_validation(worktree_root, &self.arch_contract));
        } else {
            report.add_check(CheckResult::skip("light", "light validation disabled"));
        }

        if !config.heavy_validation_mode.is_off() {
            let heavy_report =
                heavy::run_heavy_validation(worktree_root, &self.heavy_options).await;
            report.merge(heavy_report);
        } else {
            report.add_check(CheckResult::skip("heavy", "heavy validation disabled"));
        }

        report.finalize();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_iff_blocking_zero() {
        let mut report = ValidationReport::new();
        report.add_check(CheckResult::pass("architecture", "clean"));
        report.add_check(CheckResult::skip("heavy", "disabled"));
        assert!(report.ok());
        assert_eq!(report.blocking_count(), 0);

        report.add_check(CheckResult::fail("typecheck", "2 errors"));
        assert!(!report.ok());
        assert_eq!(report.blocking_count(), 1);
        assert_eq!(report.failed_check_ids(), vec!["typecheck"]);
    }

    #[test]
    fn test_cycles_and_violations_block() {
        let mut report = ValidationReport::new();
        report.add_violations(vec![crate::findings::Violation::error(
            "ARCH.LAYER_MATRIX",
            "src/a.ts",
            "m",
        )]);
        report.cycles.push(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(report.blocking_count(), 2);
        assert!(!report.ok());
    }

    #[test]
    fn test_warnings_do_not_block() {
        let mut report = ValidationReport::new();
        report.add_violations(vec![crate::findings::Violation::warning(
            "SEC.RATE_LIMIT_MISSING",
            "src/app.ts",
            "m",
        )]);
        assert!(report.ok());
        assert_eq!(report.warning_count(), 1);
    }

    #[test]
    fn test_merge_dedups_violations() {
        let mut a = ValidationReport::new();
        a.add_violations(vec![crate::findings::Violation::error("R", "f", "m")]);
        let mut b = ValidationReport::new();
        b.add_violations(vec![crate::findings::Violation::error("R", "f", "m")]);
        a.merge(b);
        assert_eq!(a.violations.len(), 1);
    }

    #[test]
    fn test_summary_shape() {
        let mut report = ValidationReport::new();
        report.add_check(CheckResult::pass("architecture", "clean"));
        let summary = report.summary();
        assert!(summary.contains("PASS"));
        assert!(summary.contains("architecture:pass"));
    }
}
