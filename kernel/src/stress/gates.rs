//! Stress acceptance gates
//!
//! Statistical thresholds evaluated over a session's learning events. The
//! legal-slow carve-out suppresses only the convergence gate: slow but
//! monotone improvement is not a convergence failure.

use crate::failures::FailureCluster;
use crate::learning::{LearningEvent, LearningOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label marking a legal-slow scenario row.
pub const LEGAL_SLOW_LABEL: &str = "legal_slow_convergence";

/// Gate identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateId {
    #[serde(rename = "CLUSTER_REGRESSION_SPIKE")]
    ClusterRegressionSpike,
    #[serde(rename = "CONVERGENCE_FAILURE")]
    ConvergenceFailure,
    #[serde(rename = "MICRO_STALL_SPIRAL")]
    MicroStallSpiral,
    #[serde(rename = "DEBT_PAYDOWN_FAILURE")]
    DebtPaydownFailure,
}

impl std::fmt::Display for GateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClusterRegressionSpike => "CLUSTER_REGRESSION_SPIKE",
            Self::ConvergenceFailure => "CONVERGENCE_FAILURE",
            Self::MicroStallSpiral => "MICRO_STALL_SPIRAL",
            Self::DebtPaydownFailure => "DEBT_PAYDOWN_FAILURE",
        };
        write!(f, "{s}")
    }
}

/// Acceptance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Per-cluster regression rate ceiling.
    pub cluster_regression_max: f64,
    /// Session-wide convergence rate floor.
    pub convergence_min: f64,
    /// Minimum micro-repair rows before the stall gate applies.
    pub micro_stall_min_runs: usize,
    /// Stall-rate ceiling for micro repairs.
    pub micro_stall_rate_max: f64,
    /// Minimum stub creations before the debt gate applies.
    pub debt_min_stub_events: usize,
    /// Minimum paydown attempts before the debt gate applies.
    pub debt_min_attempts: usize,
    /// Paydown-rate floor.
    pub debt_min_paydown_rate: f64,
    /// Slack for the legal-slow monotone blocking series.
    pub epsilon: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            cluster_regression_max: 0.4,
            convergence_min: 0.5,
            micro_stall_min_runs: 5,
            micro_stall_rate_max: 0.6,
            debt_min_stub_events: 3,
            debt_min_attempts: 3,
            debt_min_paydown_rate: 0.3,
            epsilon: 1.0,
        }
    }
}

/// One gate's evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFinding {
    pub gate: GateId,
    pub triggered: bool,
    pub detail: String,
}

/// Legal-slow window statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegalSlowStats {
    /// Every row in the window carries the legal-slow label.
    pub eligible: bool,
    /// Eligible, with no regressions and acceptable paydown or a bounded
    /// monotone non-increasing blocking series.
    pub accepted: bool,
    pub rows: usize,
}

/// Full gate report for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub findings: Vec<GateFinding>,
    pub legal_slow: LegalSlowStats,
    /// No gate triggered.
    pub accepted: bool,
}

impl GateReport {
    pub fn triggered(&self) -> Vec<GateId> {
        self.findings
            .iter()
            .filter(|f| f.triggered)
            .map(|f| f.gate)
            .collect()
    }
}

/// Rows that represent correction attempts (have a blocking series).
fn correction_rows(events: &[LearningEvent]) -> Vec<&LearningEvent> {
    events
        .iter()
        .filter(|e| e.blocking_before > 0 || e.blocking_after > 0 || e.delta != 0)
        .collect()
}

/// Debt paydown statistics over a session.
#[derive(Debug, Clone, Copy)]
struct DebtStats {
    stub_creates: usize,
    attempts: usize,
    paydowns: usize,
}

fn debt_stats(events: &[LearningEvent]) -> DebtStats {
    let stub_creates = events
        .iter()
        .filter(|e| {
            e.phase == "import_resolution_recipe" && e.outcome == LearningOutcome::ProvisionallyFixed
        })
        .count();
    let attempts = events.iter().filter(|e| e.phase == "debt_resolution").count();
    let paydowns = events
        .iter()
        .filter(|e| {
            e.phase == "debt_resolution"
                && e.outcome == LearningOutcome::Success
                && e.metadata
                    .get("debtPaidDown")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false)
        })
        .count();
    DebtStats {
        stub_creates,
        attempts,
        paydowns,
    }
}

fn debt_paydown_accepted(stats: DebtStats, thresholds: &GateThresholds) -> bool {
    if stats.stub_creates == 0 {
        return true;
    }
    stats.paydowns as f64 / stats.stub_creates as f64 >= thresholds.debt_min_paydown_rate
}

/// Compute the legal-slow carve-out over the window.
pub fn legal_slow_stats(events: &[LearningEvent], thresholds: &GateThresholds) -> LegalSlowStats {
    let rows = events.len();
    let eligible = rows > 0 && events.iter().all(|e| e.label() == Some(LEGAL_SLOW_LABEL));
    if !eligible {
        return LegalSlowStats {
            eligible,
            accepted: false,
            rows,
        };
    }

    let no_regressions = events.iter().all(|e| !e.regression_flag);
    let paydown_ok = debt_paydown_accepted(debt_stats(events), thresholds);

    // Bounded monotone non-increasing blocking series within epsilon.
    let series: Vec<f64> = correction_rows(events)
        .iter()
        .map(|e| f64::from(e.blocking_after))
        .collect();
    let monotone = series
        .windows(2)
        .all(|pair| pair[1] <= pair[0] + thresholds.epsilon);

    LegalSlowStats {
        eligible,
        accepted: no_regressions && (paydown_ok || monotone),
        rows,
    }
}

/// Evaluate every gate over a session's events.
pub fn evaluate_gates(events: &[LearningEvent], thresholds: &GateThresholds) -> GateReport {
    let legal_slow = legal_slow_stats(events, thresholds);
    let corrections = correction_rows(events);
    let mut findings = Vec::new();

    // CLUSTER_REGRESSION_SPIKE: any cluster whose rows regress too often.
    let mut per_cluster: BTreeMap<FailureCluster, (usize, usize)> = BTreeMap::new();
    for event in &corrections {
        for cluster in &event.clusters {
            let entry = per_cluster.entry(*cluster).or_insert((0, 0));
            entry.0 += 1;
            if event.regression_flag {
                entry.1 += 1;
            }
        }
    }
    let spiking: Vec<String> = per_cluster
        .iter()
        .filter(|(_, (total, regressions))| {
            *total > 0 && *regressions as f64 / *total as f64 > thresholds.cluster_regression_max
        })
        .map(|(cluster, (total, regressions))| format!("{cluster}={regressions}/{total}"))
        .collect();
    findings.push(GateFinding {
        gate: GateId::ClusterRegressionSpike,
        triggered: !spiking.is_empty(),
        detail: if spiking.is_empty() {
            "no cluster exceeded the regression ceiling".to_string()
        } else {
            format!("regressing clusters: {}", spiking.join(", "))
        },
    });

    // CONVERGENCE_FAILURE, suppressed by the legal-slow carve-out only.
    let convergence_rate = if corrections.is_empty() {
        1.0
    } else {
        corrections.iter().filter(|e| e.convergence_flag).count() as f64
            / corrections.len() as f64
    };
    let convergence_triggered =
        convergence_rate < thresholds.convergence_min && !legal_slow.accepted;
    findings.push(GateFinding {
        gate: GateId::ConvergenceFailure,
        triggered: convergence_triggered,
        detail: format!(
            "convergence rate {convergence_rate:.2} (floor {:.2}){}",
            thresholds.convergence_min,
            if legal_slow.accepted {
                "; legal-slow carve-out applied"
            } else {
                ""
            }
        ),
    });

    // MICRO_STALL_SPIRAL over micro-targeted repair rows.
    let micro: Vec<&&LearningEvent> = corrections
        .iter()
        .filter(|e| e.phase == "micro_targeted_repair")
        .collect();
    let stalled = micro
        .iter()
        .filter(|e| e.outcome == LearningOutcome::Stalled)
        .count();
    let micro_triggered = micro.len() >= thresholds.micro_stall_min_runs
        && stalled as f64 / micro.len() as f64 > thresholds.micro_stall_rate_max;
    findings.push(GateFinding {
        gate: GateId::MicroStallSpiral,
        triggered: micro_triggered,
        detail: format!("{stalled}/{} micro repairs stalled", micro.len()),
    });

    // DEBT_PAYDOWN_FAILURE.
    let stats = debt_stats(events);
    let paydown_rate = if stats.stub_creates == 0 {
        1.0
    } else {
        stats.paydowns as f64 / stats.stub_creates as f64
    };
    let debt_triggered = stats.stub_creates >= thresholds.debt_min_stub_events
        && stats.attempts >= thresholds.debt_min_attempts
        && paydown_rate < thresholds.debt_min_paydown_rate;
    findings.push(GateFinding {
        gate: GateId::DebtPaydownFailure,
        triggered: debt_triggered,
        detail: format!(
            "{} stubs, {} attempts, paydown rate {paydown_rate:.2}",
            stats.stub_creates, stats.attempts
        ),
    });

    let accepted = findings.iter().all(|f| !f.triggered);
    GateReport {
        findings,
        legal_slow,
        accepted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(
        phase: &str,
        outcome: LearningOutcome,
        before: u32,
        after: u32,
        clusters: Vec<FailureCluster>,
        label: Option<&str>,
    ) -> LearningEvent {
        let mut event = LearningEvent::new("run", phase, outcome)
            .with_blocking(before, after)
            .with_clusters(clusters);
        if let Some(label) = label {
            event = event.with_metadata(json!({ "label": label }));
        }
        event
    }

    #[test]
    fn test_healthy_session_accepted() {
        let events = vec![
            row("validation_correction", LearningOutcome::Success, 5, 0, vec![FailureCluster::Typecheck], None),
            row("validation_correction", LearningOutcome::Success, 3, 0, vec![FailureCluster::Test], None),
        ];
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.accepted, "{:?}", report.findings);
        assert!(report.triggered().is_empty());
    }

    #[test]
    fn test_cluster_regression_spike() {
        let events = vec![
            row("validation_correction", LearningOutcome::Stalled, 3, 5, vec![FailureCluster::Architecture], None),
            row("validation_correction", LearningOutcome::Stalled, 5, 7, vec![FailureCluster::Architecture], None),
            row("validation_correction", LearningOutcome::Success, 7, 0, vec![FailureCluster::Architecture], None),
        ];
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report
            .triggered()
            .contains(&GateId::ClusterRegressionSpike));
    }

    #[test]
    fn test_convergence_failure() {
        let events = vec![
            row("validation_correction", LearningOutcome::Stalled, 5, 5, vec![], None),
            row("validation_correction", LearningOutcome::Stalled, 5, 5, vec![], None),
            row("validation_correction", LearningOutcome::Success, 5, 0, vec![], None),
        ];
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.triggered().contains(&GateId::ConvergenceFailure));
    }

    #[test]
    fn test_legal_slow_suppresses_only_convergence() {
        // Slow but monotone: 10 → 9 → 9 → 9 → 9. Convergence rate 0.25 is
        // under the 0.5 floor, yet the series never regresses.
        let events = vec![
            row("validation_correction", LearningOutcome::ProvisionallyFixed, 10, 9, vec![], Some(LEGAL_SLOW_LABEL)),
            row("validation_correction", LearningOutcome::Stalled, 9, 9, vec![], Some(LEGAL_SLOW_LABEL)),
            row("validation_correction", LearningOutcome::Stalled, 9, 9, vec![], Some(LEGAL_SLOW_LABEL)),
            row("validation_correction", LearningOutcome::Stalled, 9, 9, vec![], Some(LEGAL_SLOW_LABEL)),
        ];
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.legal_slow.eligible);
        assert!(report.legal_slow.accepted);
        assert!(!report.triggered().contains(&GateId::ConvergenceFailure));
    }

    #[test]
    fn test_legal_slow_not_eligible_with_unlabelled_row() {
        let events = vec![
            row("validation_correction", LearningOutcome::Stalled, 9, 9, vec![], Some(LEGAL_SLOW_LABEL)),
            row("validation_correction", LearningOutcome::Stalled, 9, 9, vec![], None),
        ];
        let stats = legal_slow_stats(&events, &GateThresholds::default());
        assert!(!stats.eligible);
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.triggered().contains(&GateId::ConvergenceFailure));
    }

    #[test]
    fn test_legal_slow_rejected_on_regression() {
        let events = vec![
            row("validation_correction", LearningOutcome::Stalled, 9, 11, vec![], Some(LEGAL_SLOW_LABEL)),
            row("validation_correction", LearningOutcome::Stalled, 11, 11, vec![], Some(LEGAL_SLOW_LABEL)),
        ];
        let stats = legal_slow_stats(&events, &GateThresholds::default());
        assert!(stats.eligible);
        assert!(!stats.accepted);
    }

    #[test]
    fn test_micro_stall_spiral() {
        let mut events: Vec<LearningEvent> = (0..5)
            .map(|_| row("micro_targeted_repair", LearningOutcome::Stalled, 4, 4, vec![], None))
            .collect();
        events.push(row("micro_targeted_repair", LearningOutcome::Success, 4, 0, vec![], None));
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.triggered().contains(&GateId::MicroStallSpiral));
    }

    #[test]
    fn test_debt_paydown_failure() {
        let mut events = Vec::new();
        for _ in 0..4 {
            events.push(
                LearningEvent::new("run", "import_resolution_recipe", LearningOutcome::ProvisionallyFixed),
            );
        }
        for _ in 0..3 {
            events.push(LearningEvent::new("run", "debt_resolution", LearningOutcome::Failed));
        }
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(report.triggered().contains(&GateId::DebtPaydownFailure));

        // Enough paydowns clears the gate.
        events.push(
            LearningEvent::new("run", "debt_resolution", LearningOutcome::Success)
                .with_metadata(json!({ "debtPaidDown": true })),
        );
        events.push(
            LearningEvent::new("run", "debt_resolution", LearningOutcome::Success)
                .with_metadata(json!({ "debtPaidDown": true })),
        );
        let report = evaluate_gates(&events, &GateThresholds::default());
        assert!(!report.triggered().contains(&GateId::DebtPaydownFailure));
    }
}
