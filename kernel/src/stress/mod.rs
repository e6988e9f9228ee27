//! Stress harness: deterministic scenario selection and acceptance gates
//!
//! Drives the same kernel repeatedly under fixture scenarios chosen by a
//! seeded xorshift from the session seed, collects every learning row, and
//! evaluates the acceptance gates over the session.

pub mod fixtures;
pub mod gates;

use crate::errors::KernelResult;
use crate::learning::LearningEvent;
use self::fixtures::ScenarioKind;
use self::gates::{GateReport, GateThresholds};
use serde::{Deserialize, Serialize};

/// xorshift64* step. State must be non-zero; the caller seeds it once per
/// session so the scenario sequence is a pure function of the seed.
pub fn xorshift64star(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

/// A scenario in the pool.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub kind: ScenarioKind,
    /// Optional label stamped into every emitted row (e.g. the legal-slow
    /// marker).
    pub label: Option<String>,
}

/// The scenario pool.
#[derive(Debug, Clone)]
pub struct ScenarioPool {
    pub scenarios: Vec<Scenario>,
}

impl ScenarioPool {
    /// The standard mixed pool.
    pub fn standard() -> Self {
        Self {
            scenarios: vec![
                Scenario {
                    id: "happy-path".to_string(),
                    kind: ScenarioKind::HappyPath,
                    label: None,
                },
                Scenario {
                    id: "runtime-correction-recovers".to_string(),
                    kind: ScenarioKind::RuntimeCorrectionRecovers,
                    label: None,
                },
                Scenario {
                    id: "runtime-correction-exhausts".to_string(),
                    kind: ScenarioKind::RuntimeCorrectionExhausts,
                    label: None,
                },
                Scenario {
                    id: "import-debt-paydown".to_string(),
                    kind: ScenarioKind::ImportDebtPaydown,
                    label: None,
                },
            ],
        }
    }
}

/// Deterministically select `count` scenarios from the pool.
pub fn select_scenarios(pool: &ScenarioPool, session_seed: u64, count: usize) -> Vec<&Scenario> {
    let mut state = if session_seed == 0 {
        0x9E37_79B9_7F4A_7C15
    } else {
        session_seed
    };
    (0..count)
        .map(|_| {
            let roll = xorshift64star(&mut state);
            &pool.scenarios[(roll % pool.scenarios.len() as u64) as usize]
        })
        .collect()
}

/// Stress session configuration.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub session_seed: u64,
    pub runs: usize,
    pub thresholds: GateThresholds,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            session_seed: 1,
            runs: 8,
            thresholds: GateThresholds::default(),
        }
    }
}

/// Session result: every row plus the gate evaluation.
#[derive(Debug, Serialize, Deserialize)]
pub struct StressSessionSummary {
    pub session_seed: u64,
    pub runs: usize,
    pub scenario_ids: Vec<String>,
    pub events: Vec<LearningEvent>,
    pub report: GateReport,
}

/// Run a full stress session against the fixture pool.
pub async fn run_stress_session(config: &StressConfig) -> KernelResult<StressSessionSummary> {
    let pool = ScenarioPool::standard();
    let selected = select_scenarios(&pool, config.session_seed, config.runs);
    let scenario_ids: Vec<String> = selected.iter().map(|s| s.id.clone()).collect();

    let mut events = Vec::new();
    for (index, scenario) in selected.iter().enumerate() {
        tracing::info!(
            scenario = %scenario.id,
            run_index = index,
            "stress scenario starting"
        );
        let rows = fixtures::run_scenario(scenario.kind, index, scenario.label.as_deref()).await?;
        events.extend(rows);
    }

    let report = gates::evaluate_gates(&events, &config.thresholds);
    tracing::info!(
        runs = config.runs,
        rows = events.len(),
        accepted = report.accepted,
        "stress session finished"
    );

    Ok(StressSessionSummary {
        session_seed: config.session_seed,
        runs: config.runs,
        scenario_ids,
        events,
        report,
    })
}
