//! The orchestration kernel
//!
//! Drives the run state machine end to end: contract resolution, worktree
//! isolation, planning, step execution through the file session and the
//! pre-commit guard, post-plan validation, bounded correction loops, debt
//! paydown accounting, and crash replay with append-only step attempts.

pub mod debt;

use crate::contract::{
    self, build_execution_contract, resolve_execution_config, ConvergenceMode, EnvFallback,
    ExecutionConfigOverride, ResolveOptions,
};
use crate::errors::{KernelError, KernelResult};
use crate::executor::{Executor, RuntimeProbe, StepExecution};
use crate::failures::{
    self, ClassifierInput, CorrectionConstraint, CorrectionIntent, FailureClassification,
};
use crate::guard::{self, GuardReport};
use crate::learning::{LearningEvent, LearningLog, LearningOutcome};
use crate::plan::{
    AgentPlan, AgentStep, CorrectionMeta, CorrectionPhase, CorrectionPlanRequest, PlanRequest,
    Planner, PlannerError, Provider, RuntimeCorrectionRequest, StepType, Tool,
};
use crate::queue::{ClaimRequest, JobType, RunJob, TargetRole};
use crate::run::{NewRun, Run, RunStatus, RunValidationStatus, StepRecord, StepStatus};
use crate::session::{FileSession, FileSessionOptions, StagedFileChange, StepCommitMeta};
use crate::store::RunStore;
use crate::validation::{ValidationEngine, ValidationReport};
use crate::walker::SortedWalker;
use crate::worktree::{self, IsolatedWorktree};
use chrono::Utc;
use self::debt::{DebtEvent, DebtLedger};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything the kernel needs to operate one workspace.
pub struct KernelDeps {
    pub store: Arc<dyn RunStore>,
    pub planner: Arc<dyn Planner>,
    pub provider: Arc<dyn Provider>,
    pub probe: Arc<dyn RuntimeProbe>,
    pub engine: Arc<dyn ValidationEngine>,
    /// Root of the target project repository; run artifacts live under
    /// `<workspace>/.deeprun/`.
    pub workspace_root: PathBuf,
    pub node_id: String,
    /// Execute enqueued kernel jobs immediately instead of waiting for a
    /// worker to claim them.
    pub inline_execution: bool,
}

/// Request to start a new run.
pub struct StartRunRequest {
    pub run: NewRun,
    pub request_id: String,
    pub execution_config: Option<ExecutionConfigOverride>,
}

/// The orchestrator bound to one workspace.
pub struct Kernel {
    store: Arc<dyn RunStore>,
    planner: Arc<dyn Planner>,
    executor: Executor,
    engine: Arc<dyn ValidationEngine>,
    workspace_root: PathBuf,
    node_id: String,
    inline_execution: bool,
    learning: LearningLog,
}

/// Outcome of driving one step attempt.
enum StepOutcome {
    Committed {
        commit_hash: String,
        execution: StepExecution,
        staged: Vec<StagedFileChange>,
    },
    CompletedNoChanges {
        execution: StepExecution,
    },
    RuntimeFailed {
        execution: StepExecution,
    },
    GuardBlocked {
        report: GuardReport,
        execution: StepExecution,
    },
    NoChanges {
        execution: StepExecution,
    },
    DisallowedPaths {
        paths: Vec<String>,
        execution: StepExecution,
    },
    Failed {
        message: String,
        execution: StepExecution,
    },
}

impl Kernel {
    pub fn new(deps: KernelDeps) -> Self {
        let learning = LearningLog::new(&deps.workspace_root);
        Self {
            store: deps.store,
            planner: deps.planner,
            executor: Executor::new(deps.provider, deps.probe),
            engine: deps.engine,
            workspace_root: deps.workspace_root,
            node_id: deps.node_id,
            inline_execution: deps.inline_execution,
            learning,
        }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        Arc::clone(&self.store)
    }

    pub fn learning(&self) -> &LearningLog {
        &self.learning
    }

    pub fn workspace_root(&self) -> &std::path::Path {
        &self.workspace_root
    }

    fn claim_request(&self) -> ClaimRequest {
        ClaimRequest {
            node_id: self.node_id.clone(),
            target_role: TargetRole::Compute,
            worker_capabilities: Vec::new(),
            lease_seconds: 300,
        }
    }

    // ========================================================================
    // Run lifecycle entry points
    // ========================================================================

    /// Resolve the contract, persist the run, and enqueue its kernel job.
    pub async fn start_run(&self, request: StartRunRequest) -> KernelResult<Run> {
        let config = resolve_execution_config(
            None,
            request.execution_config.as_ref(),
            &EnvFallback::from_bas(),
            &ResolveOptions::default(),
        )?;
        let contract = build_execution_contract(&config)?;
        let support = contract::evaluate_execution_contract_support(&contract.material);
        if !support.supported {
            return Err(contract::ContractError::Unsupported {
                unsupported_fields: support.unsupported_fields,
            }
            .into());
        }

        let base_commit = worktree::current_commit(&self.workspace_root)?;
        let run = Run::new(request.run, config, contract.hash, Some(base_commit));
        tracing::info!(
            run_id = %run.id,
            request_id = %request.request_id,
            goal = %run.goal,
            "run created"
        );
        self.store.insert_run(&run)?;

        let job = RunJob::new(&run.id, JobType::Kernel, TargetRole::Compute);
        self.store.enqueue_job(&job)?;

        if self.inline_execution {
            if let Some(run) = self.process_next_job(&self.claim_request()).await? {
                return Ok(run);
            }
        }
        Ok(self
            .store
            .get_run(&run.id)?
            .ok_or_else(|| KernelError::RunNotFound(run.id.clone()))?)
    }

    /// Re-queue a resumable run. The requested contract must match the
    /// persisted one unless an explicit override is allowed.
    pub async fn resume_run(
        &self,
        run_id: &str,
        requested: Option<ExecutionConfigOverride>,
        allow_contract_override: bool,
    ) -> KernelResult<Run> {
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?;

        let contract = contract::guard_resume(
            &run.execution_config,
            &run.execution_contract_hash,
            requested.as_ref(),
            &EnvFallback::from_bas(),
            &ResolveOptions {
                allow_contract_override,
                ..Default::default()
            },
        )?;
        if contract.hash != run.execution_contract_hash {
            // Explicitly overridden: the run continues under the new contract.
            run.execution_config = contract.material.execution_config.clone();
            run.execution_contract_hash = contract.hash.clone();
            self.store.update_run(&run)?;
        }

        if run.status != RunStatus::Queued {
            run.transition(RunStatus::Queued)?;
            run.error_message = None;
            run.finished_at = None;
            self.store.update_run(&run)?;
        }

        let job = RunJob::new(&run.id, JobType::Kernel, TargetRole::Compute);
        self.store.enqueue_job(&job)?;

        if self.inline_execution {
            if let Some(run) = self.process_next_job(&self.claim_request()).await? {
                return Ok(run);
            }
        }
        Ok(self
            .store
            .get_run(run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?)
    }

    /// Fork a run at a step boundary into a fresh queued run sharing the
    /// commit history up to that step.
    pub fn fork_run(&self, run_id: &str, at_step: usize) -> KernelResult<Run> {
        let source = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?;

        // Base the fork on the last commit produced before the fork point.
        let records = self.store.step_records(run_id)?;
        let fork_base = records
            .iter()
            .filter(|r| r.step_index < at_step && r.commit_hash.is_some())
            .max_by_key(|r| (r.step_index, r.attempt))
            .and_then(|r| r.commit_hash.clone())
            .or_else(|| source.base_commit_hash.clone())
            .ok_or(KernelError::MissingBaseCommit)?;

        let mut fork = source.clone();
        fork.id = uuid::Uuid::new_v4().to_string();
        fork.status = RunStatus::Queued;
        fork.current_step_index = at_step;
        fork.base_commit_hash = Some(fork_base.clone());
        fork.current_commit_hash = Some(fork_base.clone());
        fork.last_valid_commit_hash = Some(fork_base);
        fork.worktree_path = None;
        fork.run_branch = None;
        fork.correction_attempts = 0;
        fork.last_correction_reason = None;
        fork.validation_status = None;
        fork.validation_result = None;
        fork.run_lock_owner = None;
        fork.run_lock_acquired_at = None;
        fork.error_message = None;
        fork.created_at = Utc::now();
        fork.updated_at = fork.created_at;
        fork.finished_at = None;

        self.store.insert_run(&fork)?;
        tracing::info!(source = %run_id, fork = %fork.id, at_step, "run forked");
        Ok(fork)
    }

    /// Request cancellation. Honored at the next step boundary.
    pub fn cancel_run(&self, run_id: &str) -> KernelResult<Run> {
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?;
        run.transition(RunStatus::Cancelling)?;
        self.store.update_run(&run)?;
        Ok(run)
    }

    /// Validate a run's current output in a fresh isolated worktree.
    pub async fn validate_run_output(&self, run_id: &str) -> KernelResult<ValidationReport> {
        let run = self
            .store
            .get_run(run_id)?
            .ok_or_else(|| KernelError::RunNotFound(run_id.to_string()))?;
        let commit = run
            .current_commit_hash
            .clone()
            .or_else(|| run.base_commit_hash.clone())
            .ok_or(KernelError::MissingBaseCommit)?;

        let worktree = IsolatedWorktree::create_or_reattach(
            &self.workspace_root,
            &self.workspace_root,
            &format!("{run_id}-out"),
            &commit,
        )?;
        let report = self
            .engine
            .validate(worktree.path(), &run.execution_config)
            .await;
        worktree.remove()?;
        Ok(report)
    }

    /// Claim and execute one queued job, if any.
    pub async fn process_next_job(&self, request: &ClaimRequest) -> KernelResult<Option<Run>> {
        let Some(job) = self.store.claim_next_job(request, Utc::now())? else {
            return Ok(None);
        };
        self.store.mark_job_running(&job.id, &request.node_id)?;
        match self.execute_run_job(&job).await {
            Ok(run) => {
                self.store.complete_job(&job.id, &request.node_id)?;
                Ok(Some(run))
            }
            Err(error) => {
                self.store
                    .fail_job(&job.id, &request.node_id, &error.to_string())?;
                Err(error)
            }
        }
    }

    /// Execute a claimed kernel job. Goal-level failures (correction
    /// limits, convergence, invariants) are recorded on the run and return
    /// `Ok`; only infrastructure failures surface as `Err`.
    pub async fn execute_run_job(&self, job: &RunJob) -> KernelResult<Run> {
        if !self.store.try_acquire_run_lock(&job.run_id, &self.node_id)? {
            let owner = self
                .store
                .get_run(&job.run_id)?
                .and_then(|r| r.run_lock_owner)
                .unwrap_or_default();
            return Err(KernelError::RunLockContested { owner });
        }

        let mut run = self
            .store
            .get_run(&job.run_id)?
            .ok_or_else(|| KernelError::RunNotFound(job.run_id.clone()))?;

        let result = self.drive_run(&mut run).await;
        if let Err(error) = &result {
            tracing::error!(run_id = %run.id, error = %error, "run attempt failed");
            run.error_message = Some(error.to_string());
            if !run.status.is_terminal() {
                let _ = run.transition(RunStatus::Failed);
            }
        }
        self.store.update_run(&run)?;
        self.store.release_run_lock(&run.id, &self.node_id)?;

        if run.status.is_terminal() {
            if let Err(error) = self.write_decision(&run) {
                tracing::warn!(run_id = %run.id, error = %error, "decision artifact not written");
            }
        }
        Ok(run)
    }

    /// Build and persist the governance decision for a run.
    pub fn write_decision(&self, run: &Run) -> KernelResult<crate::governance::GovernanceDecision> {
        let contract = build_execution_contract(&run.execution_config)?;
        let decision = crate::governance::build_decision(run, &contract)?;
        let path = self
            .workspace_root
            .join(".deeprun")
            .join("decisions")
            .join(format!("{}.json", run.id));
        crate::governance::write_decision_file(&decision, &path)?;
        Ok(decision)
    }

    // ========================================================================
    // The run loop
    // ========================================================================

    async fn drive_run(&self, run: &mut Run) -> KernelResult<()> {
        let base = run
            .base_commit_hash
            .clone()
            .ok_or(KernelError::MissingBaseCommit)?;

        let worktree = IsolatedWorktree::create_or_reattach(
            &self.workspace_root,
            &self.workspace_root,
            &run.id,
            &base,
        )?;
        run.worktree_path = Some(worktree.path().display().to_string());
        run.run_branch = Some(worktree.branch().to_string());
        if run.current_commit_hash.is_none() {
            run.current_commit_hash = Some(base.clone());
        }
        if run.last_valid_commit_hash.is_none() {
            run.last_valid_commit_hash = Some(base.clone());
        }

        // Dirty-worktree recovery: a crash between apply and commit, or any
        // out-of-band mutation, resets the tree to the last valid commit.
        let last_valid = run.last_valid_commit_hash.clone().unwrap_or(base.clone());
        let head = worktree.current_commit()?;
        if run.current_commit_hash.as_deref() != Some(last_valid.as_str())
            || head != last_valid
            || worktree.has_uncommitted_changes()?
        {
            tracing::warn!(
                run_id = %run.id,
                head = %head,
                last_valid = %last_valid,
                "dirty worktree; resetting to last valid commit"
            );
            worktree.hard_reset(&last_valid)?;
            run.current_commit_hash = Some(last_valid.clone());
        }
        self.store.update_run(run)?;

        // Plan.
        if run.status == RunStatus::Queued {
            run.transition(RunStatus::Running)?;
            self.store.update_run(run)?;
        }
        if run.plan.is_none() {
            let files = SortedWalker::new(worktree.path())
                .relative_source_files(&["ts", "tsx", "js", "json"]);
            let request = PlanRequest {
                run_id: run.id.clone(),
                goal: run.goal.clone(),
                project_files: files,
            };
            let plan = self
                .with_planner_timeout(run, self.planner.plan(request))
                .await??;
            plan.validate()?;
            run.plan = Some(plan);
            self.store.update_run(run)?;
        }

        let Some(mut plan) = run.plan.clone() else {
            return Err(PlannerError::MalformedPlan("run has no plan after planning".to_string()).into());
        };
        let mut session = FileSession::create(
            run.project_id.clone(),
            worktree.path(),
            Some(base.clone()),
            FileSessionOptions::from_config(&run.execution_config),
        );
        let mut ledger = DebtLedger::scan_worktree(worktree.path());

        // Step loop.
        let mut index = run.current_step_index;
        while index < plan.steps.len() {
            if self.cancellation_requested(run)? {
                run.transition(RunStatus::Cancelled)?;
                self.store.update_run(run)?;
                return Ok(());
            }

            let step = plan.steps[index].clone();
            let outcome = self.execute_one_step(run, &mut session, &step, index, None).await;

            match outcome {
                StepOutcome::Committed {
                    commit_hash,
                    execution,
                    staged,
                } => {
                    run.current_commit_hash = Some(commit_hash.clone());
                    run.last_valid_commit_hash = Some(commit_hash.clone());
                    self.append_step(
                        run,
                        index,
                        &step,
                        StepStatus::Completed,
                        &execution,
                        Some(&commit_hash),
                        None,
                        None,
                    )?;
                    self.record_debt(run, &mut ledger, &staged, &worktree)?;
                    index += 1;
                }
                StepOutcome::CompletedNoChanges { execution } => {
                    self.append_step(
                        run,
                        index,
                        &step,
                        StepStatus::Completed,
                        &execution,
                        None,
                        None,
                        None,
                    )?;
                    index += 1;
                }
                StepOutcome::RuntimeFailed { execution } => {
                    let logs = execution.runtime_logs.clone().unwrap_or_default();
                    let intent = runtime_intent(&logs);
                    self.append_step(
                        run,
                        index,
                        &step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some("preview runtime reported failure".to_string()),
                        Some(runtime_telemetry(intent, 0)),
                    )?;
                    index = self
                        .runtime_correction_loop(
                            run,
                            &worktree,
                            &mut session,
                            &mut ledger,
                            &mut plan,
                            index,
                            &step,
                            logs,
                        )
                        .await?;
                }
                StepOutcome::GuardBlocked { report, execution } => {
                    self.append_step(
                        run,
                        index,
                        &step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(report.summary.clone()),
                        None,
                    )?;
                    let inserted = self
                        .guard_correction(run, &worktree, &mut session, &mut ledger, &mut plan, index, &report)
                        .await?;
                    index += inserted;
                }
                StepOutcome::NoChanges { execution } => {
                    self.append_correction_failure(run, index, &step, &execution)?;
                    return Err(KernelError::CorrectionNoChanges {
                        step_id: step.id.clone(),
                    });
                }
                StepOutcome::DisallowedPaths { paths, execution } => {
                    self.append_correction_failure(run, index, &step, &execution)?;
                    return Err(KernelError::DisallowedPaths {
                        step_id: step.id.clone(),
                        paths,
                    });
                }
                StepOutcome::Failed { message, execution } => {
                    self.append_step(
                        run,
                        index,
                        &step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(message.clone()),
                        None,
                    )?;
                    return Err(KernelError::StepFailed {
                        step_id: step.id.clone(),
                        message,
                    });
                }
            }

            run.current_step_index = index;
            run.plan = Some(plan.clone());
            self.store.update_run(run)?;
        }

        // Post-plan validation and the correction loop.
        self.validate_and_correct(run, &worktree, &mut session, &mut ledger, &mut plan)
            .await
    }

    fn cancellation_requested(&self, run: &mut Run) -> KernelResult<bool> {
        let stored = self
            .store
            .get_run(&run.id)?
            .ok_or_else(|| KernelError::RunNotFound(run.id.clone()))?;
        if stored.status == RunStatus::Cancelling {
            run.status = RunStatus::Cancelling;
            return Ok(true);
        }
        Ok(false)
    }

    async fn with_planner_timeout<T>(
        &self,
        run: &Run,
        future: impl std::future::Future<Output = Result<T, PlannerError>>,
    ) -> KernelResult<Result<T, PlannerError>> {
        let timeout = Duration::from_millis(run.execution_config.planner_timeout_ms);
        match tokio::time::timeout(timeout, future).await {
            Ok(result) => Ok(result),
            Err(_) => Ok(Err(PlannerError::Timeout(
                run.execution_config.planner_timeout_ms,
            ))),
        }
    }

    // ========================================================================
    // Step execution
    // ========================================================================

    async fn execute_one_step(
        &self,
        run: &Run,
        session: &mut FileSession,
        step: &AgentStep,
        index: usize,
        constraint: Option<&CorrectionConstraint>,
    ) -> StepOutcome {
        if let Err(e) = session.begin_step(&step.id, index) {
            return StepOutcome::Failed {
                message: e.to_string(),
                execution: StepExecution {
                    status: StepStatus::Failed,
                    output: Value::Null,
                    error: Some(e.to_string()),
                    proposed_changes: Vec::new(),
                    runtime_status: None,
                    runtime_logs: None,
                },
            };
        }

        let execution = self.executor.execute_step(step, session).await;

        if step.step_type == StepType::Verify
            && step.tool == Tool::RunPreviewContainer
            && execution.runtime_status.as_deref() == Some("failed")
        {
            session.abort_step();
            return StepOutcome::RuntimeFailed { execution };
        }

        if execution.status == StepStatus::Failed {
            let message = execution
                .error
                .clone()
                .unwrap_or_else(|| "step execution failed".to_string());
            session.abort_step();
            return StepOutcome::Failed { message, execution };
        }

        if execution.proposed_changes.is_empty() {
            session.abort_step();
            if step.correction.is_some() && step.expects_mutation() {
                return StepOutcome::NoChanges { execution };
            }
            return StepOutcome::CompletedNoChanges { execution };
        }

        if let Some(constraint) = constraint {
            let disallowed: Vec<String> = execution
                .proposed_changes
                .iter()
                .map(|c| c.path.trim_start_matches("./").to_string())
                .filter(|path| !constraint.allows(path))
                .collect();
            if !disallowed.is_empty() {
                session.abort_step();
                return StepOutcome::DisallowedPaths {
                    paths: disallowed,
                    execution,
                };
            }
        }

        for change in &execution.proposed_changes {
            if let Err(e) = session.stage_change(change) {
                session.abort_step();
                return StepOutcome::Failed {
                    message: e.to_string(),
                    execution,
                };
            }
        }

        let guard_report = guard::check_staged_changes(session.project_root(), &session.staged_diffs());
        if !guard_report.ok {
            session.abort_step();
            return StepOutcome::GuardBlocked {
                report: guard_report,
                execution,
            };
        }

        let staged: Vec<StagedFileChange> =
            session.staged_diffs().into_iter().cloned().collect();

        // A staged set with no effective diff (replayed step, no-op
        // rewrite) must not reach `git commit`. Corrections are required to
        // produce a non-empty diff; plan steps complete without a commit.
        if staged.iter().all(|c| c.diff_preview.is_empty()) {
            session.abort_step();
            if step.correction.is_some() && step.expects_mutation() {
                return StepOutcome::NoChanges { execution };
            }
            return StepOutcome::CompletedNoChanges { execution };
        }

        if let Err(e) = session
            .validate_step()
            .and_then(|_| session.apply_step_changes().map(|_| ()))
        {
            session.abort_step();
            return StepOutcome::Failed {
                message: e.to_string(),
                execution,
            };
        }

        let meta = StepCommitMeta {
            run_id: run.id.clone(),
            step_index: index,
            step_id: step.id.clone(),
            summary: step.description.clone(),
        };
        match session.commit_step(&meta) {
            Ok(commit_hash) => StepOutcome::Committed {
                commit_hash,
                execution,
                staged,
            },
            Err(e) => StepOutcome::Failed {
                message: e.to_string(),
                execution,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_step(
        &self,
        run: &Run,
        index: usize,
        step: &AgentStep,
        status: StepStatus,
        execution: &StepExecution,
        commit_hash: Option<&str>,
        error: Option<String>,
        telemetry: Option<Value>,
    ) -> KernelResult<StepRecord> {
        let attempt = self.store.max_step_attempt(&run.id, index)? + 1;
        let now = Utc::now();
        let telemetry = telemetry.or_else(|| {
            step.correction.as_ref().map(|meta| {
                json!({
                    "classification": { "intent": CorrectionIntent::Unknown.to_string() },
                    "phase": meta.phase.to_string(),
                    "attempt": meta.attempt,
                })
            })
        });
        let record = StepRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            step_index: index,
            attempt,
            step_id: step.id.clone(),
            step_type: step.step_type,
            tool: step.tool,
            input_payload: step.input.clone(),
            output_payload: Some(execution.output.clone()),
            status,
            error_message: error,
            commit_hash: commit_hash.map(String::from),
            runtime_status: execution.runtime_status.clone(),
            correction_telemetry: telemetry,
            correction_policy: step
                .correction
                .as_ref()
                .map(|meta| json!({ "phase": meta.phase.to_string(), "attempt": meta.attempt })),
            created_at: now,
            finished_at: Some(now),
        };
        self.store.append_step_record(&record)?;
        Ok(record)
    }

    fn append_correction_failure(
        &self,
        run: &Run,
        index: usize,
        step: &AgentStep,
        execution: &StepExecution,
    ) -> KernelResult<()> {
        let (intent, attempt) = step
            .correction
            .as_ref()
            .map(|meta| {
                let intent = match meta.phase {
                    CorrectionPhase::Runtime => runtime_intent(
                        execution.runtime_logs.as_deref().unwrap_or_default(),
                    ),
                    _ => CorrectionIntent::ArchitectureViolation,
                };
                (intent, meta.attempt)
            })
            .unwrap_or((CorrectionIntent::Unknown, 0));
        self.append_step(
            run,
            index,
            step,
            StepStatus::Failed,
            execution,
            None,
            execution.error.clone(),
            Some(runtime_telemetry(intent, attempt)),
        )?;
        Ok(())
    }

    fn record_debt(
        &self,
        run: &Run,
        ledger: &mut DebtLedger,
        staged: &[StagedFileChange],
        worktree: &IsolatedWorktree,
    ) -> KernelResult<()> {
        let mut events = ledger.observe_commit(staged);
        let created: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                DebtEvent::StubCreated { path } => Some(path.clone()),
                DebtEvent::PaidDown { .. } => None,
            })
            .collect();
        events.extend(ledger.check_rewired(worktree.path(), &created));

        for event in events {
            match event {
                DebtEvent::StubCreated { path } => {
                    self.learning.append(
                        &LearningEvent::new(
                            &run.id,
                            "import_resolution_recipe",
                            LearningOutcome::ProvisionallyFixed,
                        )
                        .with_metadata(json!({ "stubPath": path })),
                    )?;
                }
                DebtEvent::PaidDown { path, action } => {
                    self.learning.append(
                        &LearningEvent::new(&run.id, "debt_resolution", LearningOutcome::Success)
                            .with_metadata(json!({
                                "debtPaidDown": true,
                                "debtPaydownAction": action.to_string(),
                                "stubPath": path,
                            })),
                    )?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Runtime correction (step-local)
    // ========================================================================

    /// Bounded repair loop for a failed preview verify step. The correction
    /// step is inserted at the current index; the verify step shifts one
    /// slot down and is re-executed after each repair. Returns the index
    /// one past the verify step once it passes.
    #[allow(clippy::too_many_arguments)]
    async fn runtime_correction_loop(
        &self,
        run: &mut Run,
        worktree: &IsolatedWorktree,
        session: &mut FileSession,
        ledger: &mut DebtLedger,
        plan: &mut AgentPlan,
        mut index: usize,
        verify_step: &AgentStep,
        mut runtime_logs: String,
    ) -> KernelResult<usize> {
        let max = run.execution_config.max_runtime_correction_attempts;
        let mut attempts: u32 = 0;

        loop {
            if attempts >= max {
                run.validation_status = Some(RunValidationStatus::Failed);
                return Err(KernelError::RuntimeCorrectionLimitReached { attempts, max });
            }
            attempts += 1;

            let intent = runtime_intent(&runtime_logs);
            let classification = FailureClassification {
                intent,
                rationale: format!("preview runtime failed for step '{}'", verify_step.id),
                failed_checks: vec!["boot".to_string()],
                failure_kinds: vec![crate::failures::FailureKind::BootError],
            };
            let constraint = failures::build_constraint(
                &classification,
                &[],
                run.worktree_path.as_deref(),
                run.execution_config.max_files_per_step,
                run.execution_config.max_total_diff_bytes,
            );

            // Goal-phase repair: replan under `correcting`, execute under
            // `running`.
            run.transition(RunStatus::Correcting)?;
            self.store.update_run(run)?;

            let mut correction_step = self
                .with_planner_timeout(
                    run,
                    self.planner.plan_runtime_correction(RuntimeCorrectionRequest {
                        run_id: run.id.clone(),
                        failed_step_id: verify_step.id.clone(),
                        runtime_logs: runtime_logs.clone(),
                        attempt: attempts,
                        constraint: constraint.clone(),
                    }),
                )
                .await??;
            if correction_step.correction.is_none() {
                correction_step.correction = Some(CorrectionMeta {
                    phase: CorrectionPhase::Runtime,
                    attempt: attempts,
                });
            }

            run.transition(RunStatus::Running)?;
            self.store.update_run(run)?;

            plan.steps.insert(index, correction_step.clone());
            run.plan = Some(plan.clone());
            self.store.update_run(run)?;

            let outcome = self
                .execute_one_step(run, session, &correction_step, index, Some(&constraint))
                .await;
            match outcome {
                StepOutcome::Committed {
                    commit_hash,
                    execution,
                    staged,
                } => {
                    run.current_commit_hash = Some(commit_hash.clone());
                    run.last_valid_commit_hash = Some(commit_hash.clone());
                    self.append_step(
                        run,
                        index,
                        &correction_step,
                        StepStatus::Completed,
                        &execution,
                        Some(&commit_hash),
                        None,
                        Some(runtime_telemetry(intent, attempts)),
                    )?;
                    self.record_debt(run, ledger, &staged, worktree)?;
                }
                StepOutcome::NoChanges { execution } | StepOutcome::CompletedNoChanges { execution } => {
                    self.append_step(
                        run,
                        index,
                        &correction_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some("correction produced no proposed changes".to_string()),
                        Some(runtime_telemetry(intent, attempts)),
                    )?;
                    run.validation_status = Some(RunValidationStatus::Failed);
                    return Err(KernelError::CorrectionNoChanges {
                        step_id: correction_step.id.clone(),
                    });
                }
                StepOutcome::DisallowedPaths { paths, execution } => {
                    self.append_step(
                        run,
                        index,
                        &correction_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(format!(
                            "correction step '{}' touched disallowed paths",
                            correction_step.id
                        )),
                        Some(runtime_telemetry(intent, attempts)),
                    )?;
                    return Err(KernelError::DisallowedPaths {
                        step_id: correction_step.id.clone(),
                        paths,
                    });
                }
                StepOutcome::GuardBlocked { report, execution } => {
                    self.append_step(
                        run,
                        index,
                        &correction_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(report.summary.clone()),
                        Some(runtime_telemetry(intent, attempts)),
                    )?;
                    return Err(KernelError::InvariantViolation {
                        summary: report.summary,
                    });
                }
                StepOutcome::RuntimeFailed { execution }
                | StepOutcome::Failed { execution, .. } => {
                    let message = execution
                        .error
                        .clone()
                        .unwrap_or_else(|| "correction step failed".to_string());
                    self.append_step(
                        run,
                        index,
                        &correction_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(message.clone()),
                        Some(runtime_telemetry(intent, attempts)),
                    )?;
                    return Err(KernelError::StepFailed {
                        step_id: correction_step.id.clone(),
                        message,
                    });
                }
            }

            // The verify step shifted one slot down; re-execute it.
            index += 1;
            run.current_step_index = index;
            self.store.update_run(run)?;

            let verify_outcome = self
                .execute_one_step(run, session, verify_step, index, None)
                .await;
            match verify_outcome {
                StepOutcome::RuntimeFailed { execution } => {
                    runtime_logs = execution.runtime_logs.clone().unwrap_or_default();
                    self.append_step(
                        run,
                        index,
                        verify_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some("preview runtime reported failure".to_string()),
                        Some(runtime_telemetry(runtime_intent(&runtime_logs), attempts)),
                    )?;
                    // Loop to the next correction attempt.
                }
                StepOutcome::CompletedNoChanges { execution }
                | StepOutcome::Committed { execution, .. } => {
                    self.append_step(
                        run,
                        index,
                        verify_step,
                        StepStatus::Completed,
                        &execution,
                        None,
                        None,
                        None,
                    )?;
                    index += 1;
                    run.current_step_index = index;
                    self.store.update_run(run)?;
                    return Ok(index);
                }
                StepOutcome::Failed { message, execution } => {
                    self.append_step(
                        run,
                        index,
                        verify_step,
                        StepStatus::Failed,
                        &execution,
                        None,
                        Some(message.clone()),
                        None,
                    )?;
                    return Err(KernelError::StepFailed {
                        step_id: verify_step.id.clone(),
                        message,
                    });
                }
                StepOutcome::GuardBlocked { report, .. } => {
                    return Err(KernelError::InvariantViolation {
                        summary: report.summary,
                    });
                }
                StepOutcome::NoChanges { .. } | StepOutcome::DisallowedPaths { .. } => {
                    return Err(KernelError::StepFailed {
                        step_id: verify_step.id.clone(),
                        message: "verify step produced unexpected mutations".to_string(),
                    });
                }
            }
        }
    }

    // ========================================================================
    // Guard-failure correction (goal phase)
    // ========================================================================

    /// Micro-targeted repair for a step the pre-commit guard blocked.
    /// Correction steps are inserted before the blocked step, which is then
    /// retried at its shifted index. Returns the number of inserted steps.
    #[allow(clippy::too_many_arguments)]
    async fn guard_correction(
        &self,
        run: &mut Run,
        worktree: &IsolatedWorktree,
        session: &mut FileSession,
        ledger: &mut DebtLedger,
        plan: &mut AgentPlan,
        index: usize,
        report: &GuardReport,
    ) -> KernelResult<usize> {
        let max = run.execution_config.max_heavy_correction_attempts;
        if run.correction_attempts >= max {
            run.validation_status = Some(RunValidationStatus::Failed);
            return Err(KernelError::InvariantViolation {
                summary: report.summary.clone(),
            });
        }

        let input = ClassifierInput {
            failures: &[],
            failed_checks: vec!["invariant_guard".to_string()],
            violations: &report.violations,
            cycles: 0,
            runtime_log_tail: None,
        };
        let classification = failures::classify(&input);
        let constraint = failures::build_constraint(
            &classification,
            &report.violations,
            run.worktree_path.as_deref(),
            run.execution_config.max_files_per_step,
            run.execution_config.max_total_diff_bytes,
        );
        let attempt = run.correction_attempts + 1;

        // Goal-phase repair: replan under `correcting`, execute under
        // `running`.
        run.transition(RunStatus::Correcting)?;
        self.store.update_run(run)?;

        let steps = self
            .with_planner_timeout(
                run,
                self.planner.plan_correction(CorrectionPlanRequest {
                    run_id: run.id.clone(),
                    reason: classification.rationale.clone(),
                    phase: CorrectionPhase::MicroTargetedRepair,
                    attempt,
                    constraint: constraint.clone(),
                    validation_excerpt: report.summary.clone(),
                    allowed_files: constraint.allowed_path_prefixes.clone(),
                }),
            )
            .await??;
        if steps.is_empty() {
            return Err(PlannerError::MalformedPlan("correction plan has no steps".to_string()).into());
        }
        let inserted = steps.len();

        run.transition(RunStatus::Running)?;
        self.store.update_run(run)?;

        for (offset, mut correction_step) in steps.into_iter().enumerate() {
            if correction_step.correction.is_none() {
                correction_step.correction = Some(CorrectionMeta {
                    phase: CorrectionPhase::MicroTargetedRepair,
                    attempt,
                });
            }
            let at = index + offset;
            plan.steps.insert(at, correction_step.clone());
            run.plan = Some(plan.clone());
            self.store.update_run(run)?;

            self.run_correction_step(run, worktree, session, ledger, &correction_step, at, &constraint)
                .await?;
        }

        run.correction_attempts = attempt;
        run.last_correction_reason = Some(classification.intent.to_string());
        self.store.update_run(run)?;

        Ok(inserted)
    }

    /// Execute one correction step with fatal handling for empty output,
    /// disallowed paths, and guard blocks.
    #[allow(clippy::too_many_arguments)]
    async fn run_correction_step(
        &self,
        run: &mut Run,
        worktree: &IsolatedWorktree,
        session: &mut FileSession,
        ledger: &mut DebtLedger,
        step: &AgentStep,
        index: usize,
        constraint: &CorrectionConstraint,
    ) -> KernelResult<()> {
        let intent = constraint.intent;
        let attempt = step.correction.as_ref().map(|m| m.attempt).unwrap_or(0);
        let outcome = self
            .execute_one_step(run, session, step, index, Some(constraint))
            .await;
        match outcome {
            StepOutcome::Committed {
                commit_hash,
                execution,
                staged,
            } => {
                run.current_commit_hash = Some(commit_hash.clone());
                run.last_valid_commit_hash = Some(commit_hash.clone());
                self.append_step(
                    run,
                    index,
                    step,
                    StepStatus::Completed,
                    &execution,
                    Some(&commit_hash),
                    None,
                    Some(runtime_telemetry(intent, attempt)),
                )?;
                self.record_debt(run, ledger, &staged, worktree)?;
                Ok(())
            }
            StepOutcome::NoChanges { execution }
            | StepOutcome::CompletedNoChanges { execution } => {
                self.append_step(
                    run,
                    index,
                    step,
                    StepStatus::Failed,
                    &execution,
                    None,
                    Some("correction produced no proposed changes".to_string()),
                    Some(runtime_telemetry(intent, attempt)),
                )?;
                Err(KernelError::CorrectionNoChanges {
                    step_id: step.id.clone(),
                })
            }
            StepOutcome::DisallowedPaths { paths, execution } => {
                self.append_step(
                    run,
                    index,
                    step,
                    StepStatus::Failed,
                    &execution,
                    None,
                    Some(format!("correction step '{}' touched disallowed paths", step.id)),
                    Some(runtime_telemetry(intent, attempt)),
                )?;
                Err(KernelError::DisallowedPaths {
                    step_id: step.id.clone(),
                    paths,
                })
            }
            StepOutcome::GuardBlocked { report, execution } => {
                self.append_step(
                    run,
                    index,
                    step,
                    StepStatus::Failed,
                    &execution,
                    None,
                    Some(report.summary.clone()),
                    Some(runtime_telemetry(intent, attempt)),
                )?;
                Err(KernelError::InvariantViolation {
                    summary: report.summary,
                })
            }
            StepOutcome::RuntimeFailed { execution } | StepOutcome::Failed { execution, .. } => {
                let message = execution
                    .error
                    .clone()
                    .unwrap_or_else(|| "correction step failed".to_string());
                self.append_step(
                    run,
                    index,
                    step,
                    StepStatus::Failed,
                    &execution,
                    None,
                    Some(message.clone()),
                    Some(runtime_telemetry(intent, attempt)),
                )?;
                Err(KernelError::StepFailed {
                    step_id: step.id.clone(),
                    message,
                })
            }
        }
    }

    // ========================================================================
    // Post-plan validation and the correction loop
    // ========================================================================

    async fn validate_and_correct(
        &self,
        run: &mut Run,
        worktree: &IsolatedWorktree,
        session: &mut FileSession,
        ledger: &mut DebtLedger,
        plan: &mut AgentPlan,
    ) -> KernelResult<()> {
        run.transition(RunStatus::Validating)?;
        self.store.update_run(run)?;

        let mut report = self
            .engine
            .validate(worktree.path(), &run.execution_config)
            .await;

        loop {
            run.validation_result = Some(json!({
                "summary": report.summary(),
                "blockingCount": report.blocking_count(),
                "warningCount": report.warning_count(),
                "failedChecks": report.failed_check_ids(),
            }));

            if report.ok() {
                run.validation_status = Some(RunValidationStatus::Passed);
                run.last_valid_commit_hash = run.current_commit_hash.clone();
                run.transition(RunStatus::Complete)?;
                self.store.update_run(run)?;
                tracing::info!(run_id = %run.id, "run complete");
                return Ok(());
            }

            let before = report.blocking_count();
            let max = run.execution_config.max_heavy_correction_attempts;
            if run.correction_attempts >= max {
                run.validation_status = Some(RunValidationStatus::Failed);
                return Err(KernelError::HeavyCorrectionLimitReached {
                    attempts: run.correction_attempts,
                    max,
                });
            }

            if self.cancellation_requested(run)? {
                run.transition(RunStatus::Cancelled)?;
                self.store.update_run(run)?;
                return Ok(());
            }

            // Classify and plan the correction round.
            let failed_checks = report.failed_check_ids();
            let input = ClassifierInput {
                failures: &report.failures,
                failed_checks,
                violations: &report.violations,
                cycles: report.cycles.len(),
                runtime_log_tail: None,
            };
            let classification = failures::classify(&input);
            let clusters = failures::clusters(&input, &classification);
            let modules = failures::implicated_modules(&report.violations);
            let architecture_collapse = classification.intent
                == CorrectionIntent::ArchitectureViolation
                && !report.cycles.is_empty()
                && modules.len() >= 2;
            let scoped = !modules.is_empty()
                || report.violations.iter().any(|v| v.file.starts_with("src/"));
            let constraint = failures::build_constraint(
                &classification,
                &report.violations,
                run.worktree_path.as_deref(),
                run.execution_config.max_files_per_step,
                run.execution_config.max_total_diff_bytes,
            );
            let attempt = run.correction_attempts + 1;
            let excerpt = validation_excerpt(&report);

            // Post-validation corrections are the optimization phase;
            // `correcting` is reserved for goal-phase repairs.
            run.transition(RunStatus::Optimizing)?;
            self.store.update_run(run)?;

            let (phase_label, new_steps) = if architecture_collapse {
                let mut steps = self
                    .plan_correction_phase(
                        run,
                        CorrectionPhase::StructuralReset,
                        attempt,
                        &classification,
                        &constraint,
                        &excerpt,
                    )
                    .await?;
                steps.extend(
                    self.plan_correction_phase(
                        run,
                        CorrectionPhase::FeatureReintegration,
                        attempt,
                        &classification,
                        &constraint,
                        &excerpt,
                    )
                    .await?,
                );
                ("structural_reset", steps)
            } else if scoped {
                (
                    "micro_targeted_repair",
                    self.plan_correction_phase(
                        run,
                        CorrectionPhase::MicroTargetedRepair,
                        attempt,
                        &classification,
                        &constraint,
                        &excerpt,
                    )
                    .await?,
                )
            } else {
                (
                    "validation_correction",
                    self.plan_correction_phase(
                        run,
                        CorrectionPhase::Plain,
                        attempt,
                        &classification,
                        &constraint,
                        &excerpt,
                    )
                    .await?,
                )
            };
            if new_steps.is_empty() {
                return Err(
                    PlannerError::MalformedPlan("correction plan has no steps".to_string()).into(),
                );
            }

            run.transition(RunStatus::Running)?;
            self.store.update_run(run)?;

            for mut correction_step in new_steps {
                if correction_step.correction.is_none() {
                    correction_step.correction = Some(CorrectionMeta {
                        phase: CorrectionPhase::Plain,
                        attempt,
                    });
                }
                let at = plan.steps.len();
                plan.steps.push(correction_step.clone());
                run.plan = Some(plan.clone());
                self.store.update_run(run)?;

                self.run_correction_step(
                    run,
                    worktree,
                    session,
                    ledger,
                    &correction_step,
                    at,
                    &constraint,
                )
                .await?;
                run.current_step_index = plan.steps.len();
                self.store.update_run(run)?;
            }

            // Re-validate and check convergence.
            run.transition(RunStatus::Validating)?;
            self.store.update_run(run)?;
            let next_report = self
                .engine
                .validate(worktree.path(), &run.execution_config)
                .await;
            let after = next_report.blocking_count();
            let delta = before as i64 - after as i64;

            let outcome = if after == 0 {
                LearningOutcome::Success
            } else if delta > 0 {
                LearningOutcome::ProvisionallyFixed
            } else {
                LearningOutcome::Stalled
            };
            self.learning.append(
                &LearningEvent::new(&run.id, phase_label, outcome)
                    .with_blocking(before as u32, after as u32)
                    .with_clusters(clusters)
                    .with_metadata(json!({ "intent": classification.intent.to_string() })),
            )?;

            if run.execution_config.correction_convergence_mode == ConvergenceMode::Enforce
                && delta <= 0
            {
                run.validation_status = Some(RunValidationStatus::Failed);
                return Err(KernelError::ConvergenceFailure { before, after });
            }

            run.correction_attempts = attempt;
            run.last_correction_reason = Some(classification.intent.to_string());
            self.store.update_run(run)?;
            report = next_report;
        }
    }

    async fn plan_correction_phase(
        &self,
        run: &Run,
        phase: CorrectionPhase,
        attempt: u32,
        classification: &FailureClassification,
        constraint: &CorrectionConstraint,
        excerpt: &str,
    ) -> KernelResult<Vec<AgentStep>> {
        let steps = self
            .with_planner_timeout(
                run,
                self.planner.plan_correction(CorrectionPlanRequest {
                    run_id: run.id.clone(),
                    reason: classification.rationale.clone(),
                    phase,
                    attempt,
                    constraint: constraint.clone(),
                    validation_excerpt: excerpt.to_string(),
                    allowed_files: constraint.allowed_path_prefixes.clone(),
                }),
            )
            .await??;
        Ok(steps
            .into_iter()
            .map(|mut step| {
                if step.correction.is_none() {
                    step.correction = Some(CorrectionMeta { phase, attempt });
                }
                step
            })
            .collect())
    }
}

/// Intent of a runtime failure from its log tail.
fn runtime_intent(logs: &str) -> CorrectionIntent {
    if logs.contains("health") {
        CorrectionIntent::RuntimeHealth
    } else {
        CorrectionIntent::RuntimeBoot
    }
}

/// Telemetry payload stored on correction-related step records.
fn runtime_telemetry(intent: CorrectionIntent, attempt: u32) -> Value {
    json!({
        "classification": { "intent": intent.to_string() },
        "attempt": attempt,
    })
}

/// First violations and failed checks, as planner-facing context.
fn validation_excerpt(report: &ValidationReport) -> String {
    let mut lines: Vec<String> = Vec::new();
    for check in report.checks.iter().filter(|c| {
        c.status == crate::validation::CheckStatus::Fail
    }) {
        lines.push(format!("check {} failed: {}", check.id, check.message));
    }
    for violation in report.violations.iter().take(10) {
        lines.push(format!(
            "{} {} ({})",
            violation.rule_id, violation.message, violation.file
        ));
    }
    for cycle in report.cycles.iter().take(3) {
        lines.push(format!("cycle: {}", cycle.join(" -> ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_intent() {
        assert_eq!(
            runtime_intent("Error: connect ECONNREFUSED"),
            CorrectionIntent::RuntimeBoot
        );
        assert_eq!(
            runtime_intent("health probe returned 503"),
            CorrectionIntent::RuntimeHealth
        );
    }

    #[test]
    fn test_runtime_telemetry_shape() {
        let telemetry = runtime_telemetry(CorrectionIntent::RuntimeBoot, 2);
        assert_eq!(telemetry["classification"]["intent"], "runtime_boot");
        assert_eq!(telemetry["attempt"], 2);
    }
}
