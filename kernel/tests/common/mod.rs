//! Shared fixtures for kernel integration tests: a scaffolded git project,
//! scripted planner/probe/validation doubles, and kernel wiring.

#![allow(dead_code)]

use async_trait::async_trait;
use deeprun_kernel::contract::ExecutionConfigOverride;
use deeprun_kernel::executor::{ProbeResult, RuntimeProbe};
use deeprun_kernel::plan::{
    AgentPlan, AgentStep, CorrectionPlanRequest, GenerateInput, GenerateOutput, PlanRequest,
    Planner, PlannerError, Provider, ProviderError, RuntimeCorrectionRequest, StepType, Tool,
};
use deeprun_kernel::run::NewRun;
use deeprun_kernel::store::MemoryStore;
use deeprun_kernel::stress::fixtures::scaffold_project;
use deeprun_kernel::validation::{CheckResult, ValidationEngine, ValidationReport};
use deeprun_kernel::{Kernel, KernelDeps, StartRunRequest};
use serde_json::json;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scaffolded project repository.
pub fn project() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    scaffold_project(dir.path()).unwrap();
    dir
}

pub fn write_step(id: &str, path: &str, content: &str) -> AgentStep {
    AgentStep {
        id: id.to_string(),
        step_type: StepType::Modify,
        tool: Tool::WriteFile,
        description: format!("write {path}"),
        input: json!({ "path": path, "content": content }),
        mutates: true,
        correction: None,
    }
}

pub fn list_step(id: &str, dir: &str) -> AgentStep {
    AgentStep {
        id: id.to_string(),
        step_type: StepType::Analyze,
        tool: Tool::ListFiles,
        description: format!("list {dir}"),
        input: json!({ "dir": dir }),
        mutates: false,
        correction: None,
    }
}

pub fn verify_step(id: &str) -> AgentStep {
    AgentStep {
        id: id.to_string(),
        step_type: StepType::Verify,
        tool: Tool::RunPreviewContainer,
        description: "boot preview".to_string(),
        input: json!({}),
        mutates: false,
        correction: None,
    }
}

/// A correction step that proposes nothing.
pub fn empty_correction_step(id: &str) -> AgentStep {
    AgentStep {
        id: id.to_string(),
        step_type: StepType::Modify,
        tool: Tool::ApplyPatch,
        description: "empty correction".to_string(),
        input: json!({ "changes": [] }),
        mutates: true,
        correction: None,
    }
}

/// Planner scripted from fixed data.
pub struct ScriptedPlanner {
    plan: AgentPlan,
    corrections: Mutex<VecDeque<Vec<AgentStep>>>,
    runtime_corrections: Mutex<VecDeque<AgentStep>>,
    /// Fallback when the runtime queue is drained: attempt → step.
    runtime_template: Option<Box<dyn Fn(u32) -> AgentStep + Send + Sync>>,
}

impl ScriptedPlanner {
    pub fn with_plan(steps: Vec<AgentStep>) -> Self {
        Self {
            plan: AgentPlan {
                goal: "scripted goal".to_string(),
                steps,
            },
            corrections: Mutex::new(VecDeque::new()),
            runtime_corrections: Mutex::new(VecDeque::new()),
            runtime_template: None,
        }
    }

    pub fn push_correction(self, steps: Vec<AgentStep>) -> Self {
        self.corrections.lock().unwrap().push_back(steps);
        self
    }

    pub fn push_runtime_correction(self, step: AgentStep) -> Self {
        self.runtime_corrections.lock().unwrap().push_back(step);
        self
    }

    pub fn runtime_template(
        mut self,
        template: impl Fn(u32) -> AgentStep + Send + Sync + 'static,
    ) -> Self {
        self.runtime_template = Some(Box::new(template));
        self
    }

    pub fn remaining_corrections(&self) -> usize {
        self.corrections.lock().unwrap().len()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, _request: PlanRequest) -> Result<AgentPlan, PlannerError> {
        Ok(self.plan.clone())
    }

    async fn plan_correction(
        &self,
        _request: CorrectionPlanRequest,
    ) -> Result<Vec<AgentStep>, PlannerError> {
        self.corrections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PlannerError::Unavailable("no scripted correction".to_string()))
    }

    async fn plan_runtime_correction(
        &self,
        request: RuntimeCorrectionRequest,
    ) -> Result<AgentStep, PlannerError> {
        if let Some(step) = self.runtime_corrections.lock().unwrap().pop_front() {
            return Ok(step);
        }
        self.runtime_template
            .as_ref()
            .map(|template| template(request.attempt))
            .ok_or_else(|| PlannerError::Unavailable("no scripted runtime correction".to_string()))
    }
}

/// Provider that proposes nothing; test plans carry explicit payloads.
pub struct NullProvider;

#[async_trait]
impl Provider for NullProvider {
    async fn generate(&self, _input: GenerateInput) -> Result<GenerateOutput, ProviderError> {
        Ok(GenerateOutput::default())
    }
}

/// Probe scripted from a result queue; drained queue repeats the default.
pub struct ScriptedProbe {
    results: Mutex<VecDeque<ProbeResult>>,
    default_failed: bool,
    default_logs: String,
}

impl ScriptedProbe {
    pub fn passing() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            default_failed: false,
            default_logs: String::new(),
        }
    }

    pub fn always_failing(logs: &str) -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            default_failed: true,
            default_logs: logs.to_string(),
        }
    }

    pub fn push(self, result: ProbeResult) -> Self {
        self.results.lock().unwrap().push_back(result);
        self
    }
}

#[async_trait]
impl RuntimeProbe for ScriptedProbe {
    async fn run_preview(&self, _step: &AgentStep) -> ProbeResult {
        if let Some(result) = self.results.lock().unwrap().pop_front() {
            return result;
        }
        if self.default_failed {
            ProbeResult::failed(self.default_logs.clone())
        } else {
            ProbeResult::passed()
        }
    }

    async fn fetch_logs(&self, _step: &AgentStep) -> String {
        self.default_logs.clone()
    }
}

/// Validation engine scripted from a report queue; drained queue passes.
pub struct ScriptedEngine {
    reports: Mutex<VecDeque<ValidationReport>>,
}

impl ScriptedEngine {
    pub fn passing() -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(self, report: ValidationReport) -> Self {
        self.reports.lock().unwrap().push_back(report);
        self
    }
}

#[async_trait]
impl ValidationEngine for ScriptedEngine {
    async fn validate(
        &self,
        worktree_root: &Path,
        _config: &deeprun_kernel::ExecutionConfig,
    ) -> ValidationReport {
        let mut report = self
            .reports
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                let mut ok = ValidationReport::new();
                ok.add_check(CheckResult::pass("scripted", "default pass"));
                ok
            });
        report.worktree_path = Some(worktree_root.display().to_string());
        report.finalize();
        report
    }
}

/// A report with `count` blocking violations anchored to `file`.
pub fn blocking_report(count: usize, file: &str) -> ValidationReport {
    let mut report = ValidationReport::new();
    report.add_check(CheckResult::fail("typecheck", format!("{count} errors")));
    let violations = (0..count.saturating_sub(1))
        .map(|i| {
            deeprun_kernel::findings::Violation::error(
                "HEAVY.TYPECHECK",
                file,
                format!("compiler error #{i}"),
            )
        })
        .collect();
    report.add_violations(violations);
    report
}

/// Wire a kernel with inline execution over a fresh embedded store.
pub fn kernel_with(
    workspace: &Path,
    planner: Arc<dyn Planner>,
    probe: Arc<dyn RuntimeProbe>,
    engine: Arc<dyn ValidationEngine>,
) -> (Kernel, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let kernel = Kernel::new(KernelDeps {
        store: store.clone(),
        planner,
        provider: Arc::new(NullProvider),
        probe,
        engine,
        workspace_root: workspace.to_path_buf(),
        node_id: "test-node".to_string(),
        inline_execution: true,
    });
    (kernel, store)
}

/// Start request with validation disabled unless overridden.
pub fn start_request(overrides: Option<ExecutionConfigOverride>) -> StartRunRequest {
    StartRunRequest {
        run: NewRun {
            project_id: "project-1".to_string(),
            org_id: "org-1".to_string(),
            workspace_id: "workspace-1".to_string(),
            created_by_user_id: "user-1".to_string(),
            goal: "implement the feature".to_string(),
            provider_id: "provider-1".to_string(),
            model: None,
        },
        request_id: "req-1".to_string(),
        execution_config: overrides,
    }
}
