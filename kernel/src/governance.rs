//! Governance decisions
//!
//! The signed verdict downstream CI consumes. The decision and its
//! contract reference are emitted as canonical JSON; `decisionHash` is the
//! SHA-256 of the canonical encoding of every field except the hash
//! itself, so consumers can verify integrity offline.

use crate::canon;
use crate::contract::{evaluate_execution_contract_support, ExecutionContract};
use crate::run::{Run, RunStatus, RunValidationStatus};
use crate::validation::v1::V1Verdict;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DECISION_SCHEMA_VERSION: u32 = 1;

pub const REASON_RUN_NOT_COMPLETE: &str = "RUN_NOT_COMPLETE";
pub const REASON_RUN_NOT_VALIDATED: &str = "RUN_NOT_VALIDATED";
pub const REASON_RUN_VALIDATION_FAILED: &str = "RUN_VALIDATION_FAILED";
pub const REASON_RUN_V1_READY_FAILED: &str = "RUN_V1_READY_FAILED";
pub const REASON_UNSUPPORTED_CONTRACT: &str = "UNSUPPORTED_CONTRACT";
pub const REASON_EXECUTION_CONTRACT_MISSING: &str = "EXECUTION_CONTRACT_MISSING";

/// The binary verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

/// Immutable reference to the contract the run executed under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractRef {
    pub hash: String,
    pub determinism_policy_version: u32,
    pub planner_policy_version: u32,
    pub correction_recipe_version: u32,
    pub validation_policy_version: u32,
}

impl From<&ExecutionContract> for ContractRef {
    fn from(contract: &ExecutionContract) -> Self {
        Self {
            hash: contract.hash.clone(),
            determinism_policy_version: contract.material.determinism_policy_version,
            planner_policy_version: contract.material.planner_policy_version,
            correction_recipe_version: contract.material.correction_recipe_version,
            validation_policy_version: contract.material.validation_policy_version,
        }
    }
}

/// The signed decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceDecision {
    pub decision_schema_version: u32,
    pub decision: Decision,
    pub reason_codes: Vec<String>,
    pub reasons: Vec<String>,
    pub run_id: String,
    pub contract: ContractRef,
    pub artifact_refs: Vec<String>,
    pub decision_hash: String,
}

/// Build the decision from a run's terminal state.
pub fn build_decision(
    run: &Run,
    contract: &ExecutionContract,
) -> Result<GovernanceDecision, serde_json::Error> {
    build_decision_with_v1(run, contract, None)
}

/// Build the decision including an optional V1-readiness verdict.
pub fn build_decision_with_v1(
    run: &Run,
    contract: &ExecutionContract,
    v1: Option<V1Verdict>,
) -> Result<GovernanceDecision, serde_json::Error> {
    let mut reason_codes: Vec<String> = Vec::new();
    let mut reasons: Vec<String> = Vec::new();
    let mut push = |code: &str, reason: String| {
        reason_codes.push(code.to_string());
        reasons.push(reason);
    };

    if run.execution_contract_hash.is_empty() {
        push(
            REASON_EXECUTION_CONTRACT_MISSING,
            "run has no execution contract hash".to_string(),
        );
    } else {
        let support = evaluate_execution_contract_support(&contract.material);
        if !support.supported {
            push(
                REASON_UNSUPPORTED_CONTRACT,
                format!(
                    "contract version fields outside supported ranges: {}",
                    support.unsupported_fields.join(", ")
                ),
            );
        }
    }

    if run.status != RunStatus::Complete {
        push(
            REASON_RUN_NOT_COMPLETE,
            format!("run ended in status '{}'", run.status),
        );
    }

    match run.validation_status {
        Some(RunValidationStatus::Passed) => {}
        Some(RunValidationStatus::Failed) => push(
            REASON_RUN_VALIDATION_FAILED,
            run.error_message
                .clone()
                .unwrap_or_else(|| "validation failed".to_string()),
        ),
        None => push(
            REASON_RUN_NOT_VALIDATED,
            "run has no validation outcome".to_string(),
        ),
    }

    if v1 == Some(V1Verdict::No) {
        push(
            REASON_RUN_V1_READY_FAILED,
            "v1 readiness checks failed".to_string(),
        );
    }

    let decision = if reason_codes.is_empty() {
        Decision::Pass
    } else {
        Decision::Fail
    };

    let mut artifact_refs = Vec::new();
    if let Some(worktree) = &run.worktree_path {
        artifact_refs.push(worktree.clone());
    }
    artifact_refs.push(format!(".deeprun/learning/runs/{}.jsonl", run.id));

    let mut record = GovernanceDecision {
        decision_schema_version: DECISION_SCHEMA_VERSION,
        decision,
        reason_codes,
        reasons,
        run_id: run.id.clone(),
        contract: ContractRef::from(contract),
        artifact_refs,
        decision_hash: String::new(),
    };
    record.decision_hash = compute_decision_hash(&record)?;
    Ok(record)
}

/// SHA-256 over the canonical JSON of every field except `decisionHash`.
pub fn compute_decision_hash(decision: &GovernanceDecision) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(decision)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("decisionHash");
    }
    Ok(canon::sha256_hex(canon::canonical_json(&value).as_bytes()))
}

/// Verify a decision's hash against its material.
pub fn verify_decision_hash(decision: &GovernanceDecision) -> Result<bool, serde_json::Error> {
    Ok(compute_decision_hash(decision)? == decision.decision_hash)
}

/// Write a decision as canonical JSON (nested objects in canonical key
/// order), newline-terminated.
pub fn write_decision_file(
    decision: &GovernanceDecision,
    path: &Path,
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = canon::canonical_json_of(decision)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, format!("{json}\n"))
}
