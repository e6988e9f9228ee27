//! deeprun kernel
//!
//! A durable, crash-safe orchestrator for autonomous code-generation runs.
//! Given a goal and a provider-backed planner, it drives a multi-step plan
//! against an isolated git worktree, validates the result, auto-corrects
//! failures within bounded budgets, and emits a signed governance decision.
//!
//! # Components
//!
//! - `contract`: versioned, hashed execution configuration
//! - `run` / `store` / `queue` / `worker`: durable records, lease-based jobs
//! - `session`: transactional file staging with optimistic locking
//! - `worktree`: isolated git checkouts per run
//! - `arch` / `checks` / `guard`: static architecture and invariant gates
//! - `validation`: light + heavy (+ docker V1 readiness) pipelines
//! - `failures`: typed failure extraction and correction constraints
//! - `kernel`: the orchestration state machine and correction loops
//! - `governance`: canonical, hash-signed PASS/FAIL decisions
//! - `stress`: deterministic scenario harness and acceptance gates

#![allow(clippy::uninlined_format_args)]

pub mod arch;
pub mod bas;
pub mod canon;
pub mod checks;
pub mod contract;
pub mod diff;
pub mod errors;
pub mod executor;
pub mod failures;
pub mod findings;
pub mod governance;
pub mod guard;
pub mod kernel;
pub mod learning;
pub mod plan;
pub mod queue;
pub mod run;
pub mod session;
pub mod store;
pub mod stress;
pub mod telemetry;
pub mod validation;
pub mod walker;
pub mod worker;
pub mod worktree;

// Re-export the contract surface
pub use contract::{
    build_execution_contract, evaluate_execution_contract_support, execution_config_preset,
    resolve_execution_config, ExecutionConfig, ExecutionConfigOverride, ExecutionContract,
    ExecutionProfile, ValidationMode,
};

// Re-export durable record types
pub use run::{Run, RunStatus, RunSummary, RunValidationStatus, StepRecord, StepStatus};

// Re-export queue and store types
pub use queue::{ClaimRequest, JobStatus, JobType, RunJob, TargetRole, WorkerNode};
pub use store::{MemoryStore, RunStore, StoreError};

// Re-export the planning seam
pub use plan::{
    AgentPlan, AgentStep, ChangeType, CorrectionPhase, Planner, PlannerError, ProposedFileChange,
    Provider, StepType, Tool,
};

// Re-export session and worktree types
pub use session::{FileSession, FileSessionOptions, SessionError, StagedFileChange};
pub use worktree::IsolatedWorktree;

// Re-export validation types
pub use validation::{
    CheckResult, CheckStatus, DefaultValidationEngine, ValidationEngine, ValidationReport,
};

// Re-export failure classification types
pub use failures::{
    CorrectionConstraint, CorrectionIntent, FailureClassification, FailureCluster, FailureKind,
    ValidationFailure,
};

// Re-export the kernel
pub use kernel::{Kernel, KernelDeps, StartRunRequest};

// Re-export governance types
pub use governance::{Decision, GovernanceDecision};

// Re-export learning and stress types
pub use learning::{LearningEvent, LearningLog, LearningOutcome};
pub use stress::gates::{GateId, GateReport, GateThresholds};

// Re-export kernel errors
pub use errors::{KernelError, KernelResult};
