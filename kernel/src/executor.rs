//! Step executor: tag dispatch from (step type, tool) to an operation
//!
//! The executor never mutates the tree itself — mutating tools return
//! proposed changes that flow through the file session, the guard, and the
//! per-step commit in the kernel.

use crate::plan::{
    AgentStep, ChangeType, GenerateInput, ProposedFileChange, Provider, Tool,
};
use crate::run::StepStatus;
use crate::session::FileSession;
use crate::walker::SortedWalker;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Result of probing a preview runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    /// `passed` or `failed`.
    pub runtime_status: String,
    pub logs: String,
}

impl ProbeResult {
    pub fn passed() -> Self {
        Self {
            runtime_status: "passed".to_string(),
            logs: String::new(),
        }
    }

    pub fn failed(logs: impl Into<String>) -> Self {
        Self {
            runtime_status: "failed".to_string(),
            logs: logs.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.runtime_status == "failed"
    }
}

/// Runtime-probe capability used by `run_preview_container` and
/// `fetch_runtime_logs` verify steps.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    async fn run_preview(&self, step: &AgentStep) -> ProbeResult;
    async fn fetch_logs(&self, step: &AgentStep) -> String;
}

/// Probe that reports a healthy runtime; wired when no preview
/// infrastructure is attached.
pub struct NoopProbe;

#[async_trait]
impl RuntimeProbe for NoopProbe {
    async fn run_preview(&self, _step: &AgentStep) -> ProbeResult {
        ProbeResult::passed()
    }

    async fn fetch_logs(&self, _step: &AgentStep) -> String {
        String::new()
    }
}

/// Execution record for one step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub status: StepStatus,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposed_changes: Vec<ProposedFileChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_logs: Option<String>,
}

impl StepExecution {
    fn completed(output: Value) -> Self {
        Self {
            status: StepStatus::Completed,
            output,
            error: None,
            proposed_changes: Vec::new(),
            runtime_status: None,
            runtime_logs: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(error),
            proposed_changes: Vec::new(),
            runtime_status: None,
            runtime_logs: None,
        }
    }
}

/// Dispatches steps to tools.
pub struct Executor {
    provider: Arc<dyn Provider>,
    probe: Arc<dyn RuntimeProbe>,
}

impl Executor {
    pub fn new(provider: Arc<dyn Provider>, probe: Arc<dyn RuntimeProbe>) -> Self {
        Self { provider, probe }
    }

    /// Execute one step against the session's project tree.
    pub async fn execute_step(&self, step: &AgentStep, session: &FileSession) -> StepExecution {
        match step.tool {
            Tool::ReadFile => self.read_file(step, session),
            Tool::ListFiles => self.list_files(step, session),
            Tool::WriteFile => self.write_file(step, session),
            Tool::ApplyPatch => self.apply_patch(step, session),
            Tool::AiMutation => self.ai_mutation(step).await,
            Tool::RunPreviewContainer => {
                let probe = self.probe.run_preview(step).await;
                let mut execution = StepExecution::completed(json!({
                    "runtimeStatus": probe.runtime_status,
                }));
                execution.runtime_status = Some(probe.runtime_status.clone());
                execution.runtime_logs = Some(probe.logs);
                execution
            }
            Tool::FetchRuntimeLogs => {
                let logs = self.probe.fetch_logs(step).await;
                let mut execution = StepExecution::completed(json!({ "bytes": logs.len() }));
                execution.runtime_logs = Some(logs);
                execution
            }
        }
    }

    fn input_str<'a>(step: &'a AgentStep, key: &str) -> Option<&'a str> {
        step.input.get(key).and_then(Value::as_str)
    }

    fn read_file(&self, step: &AgentStep, session: &FileSession) -> StepExecution {
        let Some(path) = Self::input_str(step, "path") else {
            return StepExecution::failed("read_file requires input.path");
        };
        match session.read(path) {
            Ok(content) => StepExecution::completed(json!({
                "path": path,
                "bytes": content.len(),
                "content": content,
            })),
            Err(e) => StepExecution::failed(format!("read_file failed: {e}")),
        }
    }

    fn list_files(&self, step: &AgentStep, session: &FileSession) -> StepExecution {
        let dir = Self::input_str(step, "dir").unwrap_or(".");
        let root = session.project_root().join(dir);
        let walker = SortedWalker::new(&root);
        let files: Vec<String> = walker
            .all_files()
            .iter()
            .filter_map(|p| p.strip_prefix(session.project_root()).ok())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        StepExecution::completed(json!({ "dir": dir, "files": files }))
    }

    /// `write_file` proposes a create or update depending on whether the
    /// target exists; the lock hash is captured from the current content.
    fn write_file(&self, step: &AgentStep, session: &FileSession) -> StepExecution {
        let (Some(path), Some(content)) = (
            Self::input_str(step, "path"),
            Self::input_str(step, "content"),
        ) else {
            return StepExecution::failed("write_file requires input.path and input.content");
        };

        let change = match session.read(path) {
            Ok(existing) => ProposedFileChange {
                path: path.to_string(),
                change_type: ChangeType::Update,
                new_content: Some(content.to_string()),
                old_content_hash: Some(crate::canon::sha256_hex(existing.as_bytes())),
            },
            Err(_) => ProposedFileChange {
                path: path.to_string(),
                change_type: ChangeType::Create,
                new_content: Some(content.to_string()),
                old_content_hash: None,
            },
        };

        let mut execution = StepExecution::completed(json!({ "path": path }));
        execution.proposed_changes = vec![change];
        execution
    }

    /// `apply_patch` carries explicit proposed changes in its payload.
    fn apply_patch(&self, step: &AgentStep, _session: &FileSession) -> StepExecution {
        let changes: Vec<ProposedFileChange> = match step
            .input
            .get("changes")
            .map(|v| serde_json::from_value(v.clone()))
        {
            Some(Ok(changes)) => changes,
            Some(Err(e)) => {
                return StepExecution::failed(format!("apply_patch payload malformed: {e}"))
            }
            None => return StepExecution::failed("apply_patch requires input.changes"),
        };
        let mut execution = StepExecution::completed(json!({ "files": changes.len() }));
        execution.proposed_changes = changes;
        execution
    }

    async fn ai_mutation(&self, step: &AgentStep) -> StepExecution {
        let prompt = Self::input_str(step, "prompt")
            .unwrap_or(&step.description)
            .to_string();
        match self
            .provider
            .generate(GenerateInput {
                prompt,
                context: step.input.clone(),
            })
            .await
        {
            Ok(output) => {
                let mut execution = StepExecution::completed(json!({
                    "files": output.files.len(),
                    "commands": output.commands,
                }));
                execution.proposed_changes = output.files;
                execution
            }
            Err(e) => StepExecution::failed(format!("provider generation failed: {e}")),
        }
    }
}
