//! Kernel error taxonomy
//!
//! Component errors bubble through `KernelError` with stable, matchable
//! messages: terminal run failures store `error.to_string()` as the run's
//! single user-visible `error_message`, so Display formats here are part
//! of the interface.

use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Contract(#[from] crate::contract::ContractError),

    #[error(transparent)]
    Planner(#[from] crate::plan::PlannerError),

    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Worktree(#[from] crate::worktree::WorktreeError),

    #[error(transparent)]
    Transition(#[from] crate::run::IllegalRunTransition),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run lock contested; held by {owner}")]
    RunLockContested { owner: String },

    #[error("run has no base commit")]
    MissingBaseCommit,

    #[error("step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("Correction step '{step_id}' produced no proposed changes")]
    CorrectionNoChanges { step_id: String },

    #[error("correction step '{step_id}' touched disallowed paths: {}", paths.join(", "))]
    DisallowedPaths { step_id: String, paths: Vec<String> },

    #[error("Runtime correction limit reached ({attempts}/{max}).")]
    RuntimeCorrectionLimitReached { attempts: u32, max: u32 },

    #[error("Heavy correction limit reached ({attempts}/{max}).")]
    HeavyCorrectionLimitReached { attempts: u32, max: u32 },

    #[error("Heavy validation did not converge: blocking count {before} -> {after}.")]
    ConvergenceFailure { before: usize, after: usize },

    #[error("invariant violations blocked the step: {summary}")]
    InvariantViolation { summary: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    /// Stable reason code for governance consumers.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Contract(e) => e.reason_code(),
            Self::Planner(_) => "PLANNER_FAILURE",
            Self::Session(_) => "FILE_SESSION_FAILURE",
            Self::Store(_) => "STORE_FAILURE",
            Self::Worktree(_) => "WORKTREE_FAILURE",
            Self::Transition(_) => "ILLEGAL_TRANSITION",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::RunLockContested { .. } => "RUN_LOCK_CONTESTED",
            Self::MissingBaseCommit => "MISSING_BASE_COMMIT",
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::CorrectionNoChanges { .. } => "CORRECTION_NO_CHANGES",
            Self::DisallowedPaths { .. } => "CORRECTION_DISALLOWED_PATHS",
            Self::RuntimeCorrectionLimitReached { .. } => "CORRECTION_LIMIT_REACHED",
            Self::HeavyCorrectionLimitReached { .. } => "CORRECTION_LIMIT_REACHED",
            Self::ConvergenceFailure { .. } => "CONVERGENCE_FAILURE",
            Self::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}
