//! Plans, steps, tools, and the planner/provider capability seams
//!
//! The planner and provider are opaque contracts: the kernel hands them
//! structured requests and receives plans, correction steps, or proposed
//! file changes. Tools are tagged variants dispatched by tag, not virtual
//! methods.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Plan schema bounds.
pub const MIN_PLAN_STEPS: usize = 1;
pub const MAX_PLAN_STEPS: usize = 20;

/// Step categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Analyze,
    Modify,
    Verify,
}

/// The closed tool set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    ReadFile,
    WriteFile,
    ApplyPatch,
    ListFiles,
    RunPreviewContainer,
    FetchRuntimeLogs,
    AiMutation,
}

impl Tool {
    /// Whether this tool is expected to propose file changes.
    pub fn mutates(self) -> bool {
        matches!(self, Self::WriteFile | Self::ApplyPatch | Self::AiMutation)
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::ApplyPatch => "apply_patch",
            Self::ListFiles => "list_files",
            Self::RunPreviewContainer => "run_preview_container",
            Self::FetchRuntimeLogs => "fetch_runtime_logs",
            Self::AiMutation => "ai_mutation",
        };
        write!(f, "{s}")
    }
}

/// A single planned step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    /// Planner-assigned step id, unique within the plan.
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub tool: Tool,
    /// Short human-readable summary, used in commit messages.
    pub description: String,
    /// Tool-specific payload.
    #[serde(default)]
    pub input: Value,
    /// Explicit mutation flag; `modify` steps with mutating tools default on.
    #[serde(default)]
    pub mutates: bool,
    /// Set on steps emitted by a correction planner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<CorrectionMeta>,
}

impl AgentStep {
    /// Whether executing this step is expected to stage file changes.
    pub fn expects_mutation(&self) -> bool {
        self.mutates || (self.step_type == StepType::Modify && self.tool.mutates())
    }
}

/// Correction provenance on a planner-emitted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CorrectionMeta {
    pub phase: CorrectionPhase,
    pub attempt: u32,
}

/// Correction plan phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionPhase {
    /// Step-local runtime repair after a failed preview.
    Runtime,
    /// Phase 1 of an architecture-collapse recovery: scaffolding only.
    StructuralReset,
    /// Phase 2 of an architecture-collapse recovery: feature code on top.
    FeatureReintegration,
    /// Narrow repair constrained to an explicit file list.
    MicroTargetedRepair,
    /// Unscoped single-step correction.
    Plain,
}

impl std::fmt::Display for CorrectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Runtime => "runtime",
            Self::StructuralReset => "structural_reset",
            Self::FeatureReintegration => "feature_reintegration",
            Self::MicroTargetedRepair => "micro_targeted_repair",
            Self::Plain => "plain",
        };
        write!(f, "{s}")
    }
}

/// An ordered plan for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPlan {
    pub goal: String,
    pub steps: Vec<AgentStep>,
}

impl AgentPlan {
    /// Schema guard: 1..=20 steps, each with a non-empty id.
    pub fn validate(&self) -> Result<(), PlannerError> {
        if self.steps.len() < MIN_PLAN_STEPS || self.steps.len() > MAX_PLAN_STEPS {
            return Err(PlannerError::MalformedPlan(format!(
                "plan must have {MIN_PLAN_STEPS}..={MAX_PLAN_STEPS} steps, got {}",
                self.steps.len()
            )));
        }
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(PlannerError::MalformedPlan(
                    "plan step with empty id".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A provider- or tool-proposed file change, pre-staging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedFileChange {
    /// Project-relative POSIX path.
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    /// Optimistic-lock hash of the content the proposal was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_content_hash: Option<String>,
}

/// File change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Planner input for the initial plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub run_id: String,
    pub goal: String,
    /// Sorted listing of the project's source files for grounding.
    pub project_files: Vec<String>,
}

/// Planner input for a post-validation correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionPlanRequest {
    pub run_id: String,
    pub reason: String,
    pub phase: CorrectionPhase,
    pub attempt: u32,
    pub constraint: crate::failures::CorrectionConstraint,
    /// Violation/check excerpts from the failed validation.
    pub validation_excerpt: String,
    /// Files the correction may touch when the phase is micro-targeted.
    #[serde(default)]
    pub allowed_files: Vec<String>,
}

/// Planner input for a step-local runtime correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeCorrectionRequest {
    pub run_id: String,
    pub failed_step_id: String,
    pub runtime_logs: String,
    pub attempt: u32,
    pub constraint: crate::failures::CorrectionConstraint,
}

/// Planner failures, fatal for the run attempt (the run stays resumable).
#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("planner timed out after {0} ms")]
    Timeout(u64),
    #[error("planner provider unavailable: {0}")]
    Unavailable(String),
    #[error("malformed plan: {0}")]
    MalformedPlan(String),
}

/// The planning capability set.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: PlanRequest) -> Result<AgentPlan, PlannerError>;

    async fn plan_correction(
        &self,
        request: CorrectionPlanRequest,
    ) -> Result<Vec<AgentStep>, PlannerError>;

    async fn plan_runtime_correction(
        &self,
        request: RuntimeCorrectionRequest,
    ) -> Result<AgentStep, PlannerError>;
}

/// Provider generation input: an opaque prompt plus grounding context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateInput {
    pub prompt: String,
    #[serde(default)]
    pub context: Value,
}

/// Provider output: proposed files plus optional follow-up commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOutput {
    #[serde(default)]
    pub files: Vec<ProposedFileChange>,
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider returned malformed output: {0}")]
    Malformed(String),
}

/// The opaque code-generation contract: input in, files + commands out.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn generate(&self, input: GenerateInput) -> Result<GenerateOutput, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str) -> AgentStep {
        AgentStep {
            id: id.to_string(),
            step_type: StepType::Modify,
            tool: Tool::WriteFile,
            description: "write".to_string(),
            input: json!({}),
            mutates: false,
            correction: None,
        }
    }

    #[test]
    fn test_plan_bounds() {
        let empty = AgentPlan {
            goal: "g".into(),
            steps: vec![],
        };
        assert!(empty.validate().is_err());

        let too_many = AgentPlan {
            goal: "g".into(),
            steps: (0..21).map(|i| step(&format!("s{i}"))).collect(),
        };
        assert!(too_many.validate().is_err());

        let ok = AgentPlan {
            goal: "g".into(),
            steps: vec![step("s1")],
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_empty_step_id_rejected() {
        let plan = AgentPlan {
            goal: "g".into(),
            steps: vec![step("  ")],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_modify_step_expects_mutation() {
        assert!(step("s").expects_mutation());
        let mut verify = step("v");
        verify.step_type = StepType::Verify;
        verify.tool = Tool::RunPreviewContainer;
        assert!(!verify.expects_mutation());
        verify.mutates = true;
        assert!(verify.expects_mutation());
    }

    #[test]
    fn test_plan_serde_roundtrip_canonical() {
        let plan = AgentPlan {
            goal: "add module".into(),
            steps: vec![step("step-1")],
        };
        let json = crate::canon::canonical_json_of(&plan).unwrap();
        let parsed: AgentPlan = serde_json::from_str(&json).unwrap();
        let rejson = crate::canon::canonical_json_of(&parsed).unwrap();
        assert_eq!(json, rejson);
    }

    #[test]
    fn test_tool_tags_snake_case() {
        assert_eq!(
            serde_json::to_value(Tool::RunPreviewContainer).unwrap(),
            json!("run_preview_container")
        );
        assert_eq!(Tool::AiMutation.to_string(), "ai_mutation");
    }
}
