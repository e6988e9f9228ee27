//! Deterministic stress scenario fixtures
//!
//! Each scenario builds a throwaway git project, wires the kernel with a
//! scripted planner/provider/probe, runs it inline, and emits the session's
//! learning rows. Scenarios are fully deterministic: behavior depends only
//! on the scenario kind and run index.

use crate::contract::ExecutionConfigOverride;
use crate::errors::KernelResult;
use crate::executor::{NoopProbe, ProbeResult, RuntimeProbe};
use crate::kernel::debt::format_stub_marker;
use crate::kernel::{Kernel, KernelDeps, StartRunRequest};
use crate::learning::{LearningEvent, LearningLog, LearningOutcome};
use crate::plan::{
    AgentPlan, AgentStep, CorrectionPlanRequest, GenerateInput, GenerateOutput, PlanRequest,
    Planner, PlannerError, Provider, ProviderError, RuntimeCorrectionRequest, StepType, Tool,
};
use crate::run::{NewRun, RunStatus};
use crate::store::MemoryStore;
use crate::validation::{CheckResult, ValidationEngine, ValidationReport};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The fixture scenario kinds in the standard pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Two-step plan, no failures.
    HappyPath,
    /// Preview fails once; one runtime correction recovers it.
    RuntimeCorrectionRecovers,
    /// Preview never recovers; the correction budget exhausts.
    RuntimeCorrectionExhausts,
    /// A dangling import forces a stub, paid down by a later step.
    ImportDebtPaydown,
}

/// Initialize a git project with the baseline service scaffold.
pub fn scaffold_project(root: &Path) -> std::io::Result<()> {
    let write = |path: &str, content: &str| -> std::io::Result<()> {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)
    };

    write("package.json", "{\n  \"name\": \"fixture-service\"\n}\n")?;
    write("tsconfig.json", "{}\n")?;
    write(
        "src/app.ts",
        "app.use(helmet());\napp.use(cors());\napp.use(rateLimit({}));\n",
    )?;
    write("src/server.ts", "app.listen(env.PORT);\n")?;
    write(
        "src/config/env.ts",
        "export const env = z.object({ NODE_ENV: z.enum([\"development\", \"production\"]) }).parse(process.env);\n",
    )?;
    write(
        "src/errors/errorHandler.ts",
        "if (process.env.NODE_ENV !== \"production\") { body.stack = err.stack; }\n",
    )?;

    let git = |args: &[&str]| {
        Command::new("git").args(args).current_dir(root).output().map(|_| ())
    };
    git(&["init", "-b", "main"])?;
    git(&["config", "user.email", "stress@deeprun.local"])?;
    git(&["config", "user.name", "deeprun stress"])?;
    git(&["add", "."])?;
    git(&["commit", "-m", "fixture scaffold"])?;
    Ok(())
}

/// Planner scripted per scenario kind.
pub struct FixturePlanner {
    kind: ScenarioKind,
    correction_counter: AtomicU32,
}

impl FixturePlanner {
    pub fn new(kind: ScenarioKind) -> Self {
        Self {
            kind,
            correction_counter: AtomicU32::new(0),
        }
    }

    fn write_step(id: &str, path: &str, content: &str) -> AgentStep {
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

    fn verify_step(id: &str) -> AgentStep {
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
}

#[async_trait]
impl Planner for FixturePlanner {
    async fn plan(&self, request: PlanRequest) -> Result<AgentPlan, PlannerError> {
        let steps = match self.kind {
            ScenarioKind::HappyPath => vec![
                Self::write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
                AgentStep {
                    id: "step-2".to_string(),
                    step_type: StepType::Analyze,
                    tool: Tool::ListFiles,
                    description: "list src".to_string(),
                    input: json!({ "dir": "src" }),
                    mutates: false,
                    correction: None,
                },
            ],
            ScenarioKind::RuntimeCorrectionRecovers | ScenarioKind::RuntimeCorrectionExhausts => {
                vec![
                    Self::write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
                    Self::verify_step("step-2"),
                ]
            }
            ScenarioKind::ImportDebtPaydown => vec![
                Self::write_step(
                    "step-1",
                    "src/modules/project/service/project-service.ts",
                    "import { ProjectDto } from \"../dto/project-dto.js\";\nexport class ProjectService {}\n",
                ),
                Self::write_step(
                    "step-2",
                    "src/modules/project/dto/project-dto.ts",
                    "export interface ProjectDto { id: string; }\n",
                ),
            ],
        };
        Ok(AgentPlan {
            goal: request.goal,
            steps,
        })
    }

    async fn plan_correction(
        &self,
        request: CorrectionPlanRequest,
    ) -> Result<Vec<AgentStep>, PlannerError> {
        match self.kind {
            ScenarioKind::ImportDebtPaydown => {
                let stub_path = "src/modules/project/dto/project-dto.ts";
                let content = format!(
                    "{}\nexport interface ProjectDto {{ id: string }}\n",
                    format_stub_marker(&request.run_id, stub_path)
                );
                Ok(vec![Self::write_step(
                    &format!("stub-correction-{}", request.attempt),
                    stub_path,
                    &content,
                )])
            }
            _ => Ok(vec![Self::write_step(
                &format!("correction-{}", request.attempt),
                "src/correction.ts",
                &format!("export const correction = {};\n", request.attempt),
            )]),
        }
    }

    async fn plan_runtime_correction(
        &self,
        request: RuntimeCorrectionRequest,
    ) -> Result<AgentStep, PlannerError> {
        let attempt = self.correction_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut step = Self::write_step(
            &format!("runtime-correction-{}", request.attempt),
            "src/runtime-fix.ts",
            &format!("export const runtimeFix = {attempt};\n"),
        );
        step.description = format!("repair runtime failure in {}", request.failed_step_id);
        Ok(step)
    }
}

/// Provider that never gets called by the fixtures (write_file carries its
/// own payload); kept to satisfy the kernel seam.
pub struct FixtureProvider;

#[async_trait]
impl Provider for FixtureProvider {
    async fn generate(&self, _input: GenerateInput) -> Result<GenerateOutput, ProviderError> {
        Ok(GenerateOutput::default())
    }
}

/// Probe that fails a scripted number of times before passing.
pub struct CountdownProbe {
    failures_remaining: AtomicU32,
}

impl CountdownProbe {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl RuntimeProbe for CountdownProbe {
    async fn run_preview(&self, _step: &AgentStep) -> ProbeResult {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            ProbeResult::failed("Error: listen EADDRINUSE\n    code: 'EADDRINUSE'")
        } else {
            ProbeResult::passed()
        }
    }

    async fn fetch_logs(&self, _step: &AgentStep) -> String {
        "Error: listen EADDRINUSE".to_string()
    }
}

/// Validation engine that always passes; stress scenarios exercise the
/// step loop and correction machinery, not the heavy pipeline.
pub struct PassingEngine;

#[async_trait]
impl ValidationEngine for PassingEngine {
    async fn validate(
        &self,
        worktree_root: &Path,
        _config: &crate::contract::ExecutionConfig,
    ) -> ValidationReport {
        let mut report = ValidationReport::new();
        report.worktree_path = Some(worktree_root.display().to_string());
        report.add_check(CheckResult::pass("fixture", "scenario validation stubbed"));
        report.finalize();
        report
    }
}

/// Run one scenario and return its learning rows (kernel-emitted plus the
/// session summary row).
pub async fn run_scenario(
    kind: ScenarioKind,
    run_index: usize,
    label: Option<&str>,
) -> KernelResult<Vec<LearningEvent>> {
    let workspace = tempfile::tempdir()?;
    scaffold_project(workspace.path())?;

    let probe: Arc<dyn RuntimeProbe> = match kind {
        ScenarioKind::RuntimeCorrectionRecovers => Arc::new(CountdownProbe::new(1)),
        ScenarioKind::RuntimeCorrectionExhausts => Arc::new(CountdownProbe::new(u32::MAX)),
        _ => Arc::new(NoopProbe),
    };

    let kernel = Kernel::new(KernelDeps {
        store: Arc::new(MemoryStore::new()),
        planner: Arc::new(FixturePlanner::new(kind)),
        provider: Arc::new(FixtureProvider),
        probe,
        engine: Arc::new(PassingEngine),
        workspace_root: workspace.path().to_path_buf(),
        node_id: format!("stress-node-{run_index}"),
        inline_execution: true,
    });

    let overrides = ExecutionConfigOverride {
        max_runtime_correction_attempts: Some(match kind {
            ScenarioKind::RuntimeCorrectionExhausts => 1,
            _ => 3,
        }),
        ..Default::default()
    };

    let run = kernel
        .start_run(StartRunRequest {
            run: NewRun {
                project_id: format!("stress-project-{run_index}"),
                org_id: "stress-org".to_string(),
                workspace_id: "stress-workspace".to_string(),
                created_by_user_id: "stress".to_string(),
                goal: format!("stress scenario {kind:?}"),
                provider_id: "fixture".to_string(),
                model: None,
            },
            request_id: format!("stress-{run_index}"),
            execution_config: Some(overrides),
        })
        .await?;

    let log = LearningLog::new(workspace.path());
    let mut events = log.events_for_run(&run.id)?;

    // Session summary row for the gates.
    let records = kernel.store().step_records(&run.id)?;
    let corrections = records
        .iter()
        .filter(|r| r.correction_telemetry.is_some())
        .count() as u32;
    let outcome = if run.status == RunStatus::Complete {
        LearningOutcome::Success
    } else {
        LearningOutcome::Failed
    };
    let mut summary = LearningEvent::new(&run.id, "goal", outcome)
        .with_blocking(corrections, if run.status == RunStatus::Complete { 0 } else { corrections })
        .with_metadata(json!({
            "scenario": format!("{kind:?}"),
            "runIndex": run_index,
        }));
    if let Some(label) = label {
        summary.metadata["label"] = json!(label);
    }
    events.push(summary);

    Ok(events)
}
