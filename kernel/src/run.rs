//! Durable run and step records plus the canonical lifecycle graph
//!
//! A `Run` is the durable record of one orchestration; `StepRecord`s are an
//! append-only attempt log. Any "update" to a step is a new record with an
//! incremented attempt; existing records are never mutated in place.

use crate::contract::ExecutionConfig;
use crate::plan::{AgentPlan, StepType, Tool};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RunId = String;

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Validating,
    Correcting,
    Optimizing,
    Complete,
    Failed,
    Cancelling,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Terminal states a resume may re-queue from.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::Correcting => "correcting",
            Self::Optimizing => "optimizing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The canonical transition table.
///
/// ```text
/// queued     → running | cancelled | failed
/// running    → validating | correcting | optimizing | complete | cancelled | failed
/// validating → running | optimizing | complete | cancelled | failed
/// correcting → running | validating | cancelled | failed
/// optimizing → running | validating | complete | cancelled | failed
/// failed     → queued        (resume)
/// cancelled  → queued        (resume)
/// ```
/// `cancelling` is entered from any non-terminal state and leaves only to
/// `cancelled` or `failed`.
pub fn allowed_transition(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;

    // Cancellation request is honored from any non-terminal state.
    if to == Cancelling && !from.is_terminal() && from != Cancelling {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Running)
            | (Queued, Cancelled)
            | (Queued, Failed)
            | (Running, Validating)
            | (Running, Correcting)
            | (Running, Optimizing)
            | (Running, Complete)
            | (Running, Cancelled)
            | (Running, Failed)
            | (Validating, Running)
            | (Validating, Optimizing)
            | (Validating, Complete)
            | (Validating, Cancelled)
            | (Validating, Failed)
            | (Correcting, Running)
            | (Correcting, Validating)
            | (Correcting, Cancelled)
            | (Correcting, Failed)
            | (Optimizing, Running)
            | (Optimizing, Validating)
            | (Optimizing, Complete)
            | (Optimizing, Cancelled)
            | (Optimizing, Failed)
            | (Cancelling, Cancelled)
            | (Cancelling, Failed)
            | (Failed, Queued)
            | (Cancelled, Queued)
    )
}

/// Validation outcome recorded on the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunValidationStatus {
    Passed,
    Failed,
}

/// Attempted transition outside the canonical graph.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal run transition: {from} → {to}")]
pub struct IllegalRunTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

/// Durable record of one orchestration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub project_id: String,
    pub org_id: String,
    pub workspace_id: String,
    pub created_by_user_id: String,
    pub goal: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<AgentPlan>,
    pub current_step_index: usize,
    /// Immutable after the first commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_commit_hash: Option<String>,
    /// Advances monotonically; set only when validation passes or a
    /// successful step commits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_branch: Option<String>,
    pub correction_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_correction_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<RunValidationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<Value>,
    pub execution_config: ExecutionConfig,
    pub execution_contract_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_lock_owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_lock_acquired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Caller identity and goal for a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub project_id: String,
    pub org_id: String,
    pub workspace_id: String,
    pub created_by_user_id: String,
    pub goal: String,
    pub provider_id: String,
    pub model: Option<String>,
}

impl Run {
    pub fn new(
        request: NewRun,
        execution_config: ExecutionConfig,
        execution_contract_hash: String,
        base_commit_hash: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: request.project_id,
            org_id: request.org_id,
            workspace_id: request.workspace_id,
            created_by_user_id: request.created_by_user_id,
            goal: request.goal,
            provider_id: request.provider_id,
            model: request.model,
            status: RunStatus::Queued,
            plan: None,
            current_step_index: 0,
            base_commit_hash,
            current_commit_hash: None,
            last_valid_commit_hash: None,
            worktree_path: None,
            run_branch: None,
            correction_attempts: 0,
            last_correction_reason: None,
            validation_status: None,
            validation_result: None,
            execution_config,
            execution_contract_hash,
            run_lock_owner: None,
            run_lock_acquired_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to a new status, enforcing the canonical graph.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), IllegalRunTransition> {
        if !allowed_transition(self.status, to) {
            return Err(IllegalRunTransition {
                from: self.status,
                to,
            });
        }
        tracing::debug!(run_id = %self.id, from = %self.status, to = %to, "run transition");
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Number of planned steps (0 before planning).
    pub fn plan_len(&self) -> usize {
        self.plan.as_ref().map(|p| p.steps.len()).unwrap_or(0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Step attempt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Append-only record of one step attempt.
///
/// For any `(run_id, step_index)` the attempt numbers form a contiguous
/// 1..N sequence; `commit_hash` is set iff the attempt produced a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: String,
    pub run_id: RunId,
    pub step_index: usize,
    pub attempt: u32,
    pub step_id: String,
    pub step_type: StepType,
    pub tool: Tool,
    pub input_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_payload: Option<Value>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_telemetry: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction_policy: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Operator-facing snapshot of run progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub plan_steps: usize,
    pub correction_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_correction_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<RunValidationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            current_step_index: run.current_step_index,
            plan_steps: run.plan_len(),
            correction_attempts: run.correction_attempts,
            last_correction_reason: run.last_correction_reason.clone(),
            validation_status: run.validation_status,
            error_message: run.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{execution_config_preset, ExecutionProfile};

    fn test_run() -> Run {
        Run::new(
            NewRun {
                project_id: "proj".into(),
                org_id: "org".into(),
                workspace_id: "ws".into(),
                created_by_user_id: "user".into(),
                goal: "add health endpoint".into(),
                provider_id: "provider-a".into(),
                model: None,
            },
            execution_config_preset(ExecutionProfile::Smoke),
            "hash".into(),
            Some("abc123".into()),
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut run = test_run();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Validating).unwrap();
        run.transition(RunStatus::Complete).unwrap();
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_correction_cycle_transitions() {
        let mut run = test_run();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Validating).unwrap();
        run.transition(RunStatus::Correcting).unwrap();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Validating).unwrap();
        run.transition(RunStatus::Failed).unwrap();
    }

    #[test]
    fn test_terminal_is_sticky_except_resume() {
        let mut run = test_run();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Failed).unwrap();
        assert!(run.transition(RunStatus::Running).is_err());
        // failed → queued is the resume edge
        run.transition(RunStatus::Queued).unwrap();
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[test]
    fn test_complete_is_not_resumable() {
        let mut run = test_run();
        run.transition(RunStatus::Running).unwrap();
        run.transition(RunStatus::Complete).unwrap();
        assert!(run.transition(RunStatus::Queued).is_err());
    }

    #[test]
    fn test_cancelling_from_any_active_state() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Validating,
            RunStatus::Correcting,
            RunStatus::Optimizing,
        ] {
            assert!(allowed_transition(status, RunStatus::Cancelling));
        }
        assert!(!allowed_transition(RunStatus::Complete, RunStatus::Cancelling));
        assert!(allowed_transition(RunStatus::Cancelling, RunStatus::Cancelled));
        assert!(!allowed_transition(RunStatus::Cancelling, RunStatus::Running));
    }

    #[test]
    fn test_skip_states_rejected() {
        assert!(!allowed_transition(RunStatus::Queued, RunStatus::Validating));
        assert!(!allowed_transition(RunStatus::Queued, RunStatus::Complete));
        assert!(!allowed_transition(RunStatus::Correcting, RunStatus::Complete));
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_value(RunStatus::Validating).unwrap(),
            serde_json::json!("validating")
        );
    }

    #[test]
    fn test_summary_reflects_run() {
        let mut run = test_run();
        run.correction_attempts = 2;
        let summary = RunSummary::from(&run);
        assert_eq!(summary.correction_attempts, 2);
        assert_eq!(summary.plan_steps, 0);
    }
}
