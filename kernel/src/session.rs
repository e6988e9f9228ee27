//! File session: transactional staging of proposed file changes
//!
//! The session exclusively owns the worktree during a step. Changes are
//! staged in memory against an optimistic-lock hash of the on-disk content,
//! validated against the step budgets, then applied atomically: every hash
//! is re-checked, backups are snapshotted, and any I/O failure restores the
//! tree byte-for-byte. A successful step produces exactly one git commit.
//!
//! Per-step state machine: `idle → staging → applied → committed`, with
//! `applied → rolled_back` on abort.

use crate::canon::sha256_hex;
use crate::contract::ExecutionConfig;
use crate::diff::unified_diff;
use crate::plan::{ChangeType, ProposedFileChange};
use crate::worktree::run_git;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Path prefixes a step may never write under.
const DEFAULT_RESTRICTED_PREFIXES: &[&str] = &[".git/", ".deeprun/", "node_modules/"];

/// Maximum commit summary length.
const MAX_COMMIT_SUMMARY: usize = 80;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a step transaction is already active: {0}")]
    StepActive(String),

    #[error("no active step transaction")]
    NoActiveStep,

    #[error("step transaction in phase {actual}, expected {expected}")]
    WrongPhase { expected: StepPhase, actual: StepPhase },

    #[error("path escapes project root: {0}")]
    PathEscape(String),

    #[error("create target already exists: {0}")]
    TargetExists(String),

    #[error("target does not exist: {0}")]
    TargetMissing(String),

    #[error("missing newContent for {0}")]
    MissingContent(String),

    #[error("optimistic lock failure on {path}: expected {expected}, found {actual}")]
    OptimisticLock {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("step stages {count} files, budget is {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("staged diff is {bytes} bytes, budget is {max}")]
    DiffTooLarge { bytes: usize, max: usize },

    #[error("file {path} is {bytes} bytes, budget is {max}")]
    FileTooLarge {
        path: String,
        bytes: usize,
        max: usize,
    },

    #[error("write to restricted path: {0}")]
    RestrictedPath(String),

    #[error("env mutation blocked: {0}")]
    EnvMutationBlocked(String),

    #[error("git commit failed: {0}")]
    Commit(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

fn io_err(path: &str, source: std::io::Error) -> SessionError {
    SessionError::Io {
        path: path.to_string(),
        source,
    }
}

/// Per-step transaction phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Staging,
    Applied,
    Committed,
    RolledBack,
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Staging => "staging",
            Self::Applied => "applied",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// A staged change with its lock hashes and preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFileChange {
    /// Normalized project-relative POSIX path.
    pub path: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_content: Option<String>,
    /// On-disk SHA-256 captured at stage time; re-checked at apply time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_content_hash: Option<String>,
    pub diff_preview: String,
    pub diff_bytes: usize,
}

/// Session budgets, derived from the execution config.
#[derive(Debug, Clone)]
pub struct FileSessionOptions {
    pub max_files_per_step: usize,
    pub max_total_diff_bytes: usize,
    pub max_file_bytes: usize,
    pub allow_env_mutation: bool,
    pub restricted_prefixes: Vec<String>,
}

impl FileSessionOptions {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_files_per_step: config.max_files_per_step,
            max_total_diff_bytes: config.max_total_diff_bytes,
            max_file_bytes: config.max_file_bytes,
            allow_env_mutation: config.allow_env_mutation,
            restricted_prefixes: DEFAULT_RESTRICTED_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Commit metadata for a step.
#[derive(Debug, Clone)]
pub struct StepCommitMeta {
    pub run_id: String,
    pub step_index: usize,
    pub step_id: String,
    pub summary: String,
}

impl StepCommitMeta {
    /// `agentRunId=<id> stepIndex=<n> stepId=<id> :: <summary-≤80>`
    pub fn message(&self) -> String {
        let summary: String = self
            .summary
            .replace(['\n', '\r'], " ")
            .chars()
            .take(MAX_COMMIT_SUMMARY)
            .collect();
        format!(
            "agentRunId={} stepIndex={} stepId={} :: {}",
            self.run_id, self.step_index, self.step_id, summary
        )
    }
}

struct StepTransaction {
    step_id: String,
    step_index: usize,
    phase: StepPhase,
    /// Keyed by normalized path; BTreeMap iteration gives apply-in-path-order.
    changes: BTreeMap<String, StagedFileChange>,
    /// Pre-apply snapshots kept until commit so a failed commit can restore.
    backups: BTreeMap<String, Option<String>>,
}

/// Transactional staging state for one run.
pub struct FileSession {
    project_id: String,
    project_root: PathBuf,
    base_commit_hash: Option<String>,
    options: FileSessionOptions,
    active: Option<StepTransaction>,
}

impl FileSession {
    pub fn create(
        project_id: impl Into<String>,
        project_root: impl AsRef<Path>,
        base_commit_hash: Option<String>,
        options: FileSessionOptions,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            project_root: project_root.as_ref().to_path_buf(),
            base_commit_hash,
            options,
            active: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn base_commit_hash(&self) -> Option<&str> {
        self.base_commit_hash.as_deref()
    }

    /// Begin a step transaction. Only one may be active at a time.
    pub fn begin_step(&mut self, step_id: impl Into<String>, step_index: usize) -> SessionResult<()> {
        if let Some(active) = &self.active {
            return Err(SessionError::StepActive(active.step_id.clone()));
        }
        self.active = Some(StepTransaction {
            step_id: step_id.into(),
            step_index,
            phase: StepPhase::Staging,
            changes: BTreeMap::new(),
            backups: BTreeMap::new(),
        });
        Ok(())
    }

    /// Read a project file through the session's path discipline.
    pub fn read(&self, path: &str) -> SessionResult<String> {
        let normalized = self.normalize(path)?;
        let absolute = self.project_root.join(&normalized);
        if !absolute.exists() {
            return Err(SessionError::TargetMissing(normalized));
        }
        std::fs::read_to_string(&absolute).map_err(|e| io_err(&normalized, e))
    }

    /// Normalize to a POSIX relative path and reject escapes.
    fn normalize(&self, path: &str) -> SessionResult<String> {
        let cleaned = path.trim().replace('\\', "/");
        let cleaned = cleaned.strip_prefix("./").unwrap_or(&cleaned);
        let cleaned = cleaned.trim_start_matches('/');
        if cleaned.is_empty() {
            return Err(SessionError::PathEscape(path.to_string()));
        }
        let mut parts: Vec<&str> = Vec::new();
        for part in cleaned.split('/') {
            match part {
                "" | "." => continue,
                ".." => {
                    if parts.pop().is_none() {
                        return Err(SessionError::PathEscape(path.to_string()));
                    }
                }
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Err(SessionError::PathEscape(path.to_string()));
        }
        Ok(parts.join("/"))
    }

    fn on_disk_hash(&self, relative: &str) -> SessionResult<Option<(String, String)>> {
        let absolute = self.project_root.join(relative);
        if !absolute.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&absolute).map_err(|e| io_err(relative, e))?;
        let hash = sha256_hex(content.as_bytes());
        Ok(Some((content, hash)))
    }

    /// Stage one proposed change, enforcing existence and lock contracts.
    pub fn stage_change(&mut self, change: &ProposedFileChange) -> SessionResult<()> {
        let normalized = self.normalize(&change.path)?;
        let on_disk = self.on_disk_hash(&normalized)?;

        let active = self.active.as_mut().ok_or(SessionError::NoActiveStep)?;
        if active.phase != StepPhase::Staging {
            return Err(SessionError::WrongPhase {
                expected: StepPhase::Staging,
                actual: active.phase,
            });
        }

        let staged = match change.change_type {
            ChangeType::Create => {
                if on_disk.is_some() {
                    return Err(SessionError::TargetExists(normalized));
                }
                let new_content = change
                    .new_content
                    .clone()
                    .ok_or_else(|| SessionError::MissingContent(normalized.clone()))?;
                let diff_preview = unified_diff(&normalized, "", &new_content);
                StagedFileChange {
                    path: normalized.clone(),
                    change_type: ChangeType::Create,
                    next_content_hash: Some(sha256_hex(new_content.as_bytes())),
                    new_content: Some(new_content),
                    previous_content: None,
                    previous_content_hash: None,
                    diff_bytes: diff_preview.len(),
                    diff_preview,
                }
            }
            ChangeType::Update => {
                let (previous, disk_hash) = on_disk
                    .ok_or_else(|| SessionError::TargetMissing(normalized.clone()))?;
                let expected = change
                    .old_content_hash
                    .clone()
                    .ok_or_else(|| SessionError::OptimisticLock {
                        path: normalized.clone(),
                        expected: "<provided oldContentHash>".to_string(),
                        actual: "<none>".to_string(),
                    })?;
                if expected != disk_hash {
                    return Err(SessionError::OptimisticLock {
                        path: normalized,
                        expected,
                        actual: disk_hash,
                    });
                }
                let new_content = change
                    .new_content
                    .clone()
                    .ok_or_else(|| SessionError::MissingContent(normalized.clone()))?;
                let diff_preview = unified_diff(&normalized, &previous, &new_content);
                StagedFileChange {
                    path: normalized.clone(),
                    change_type: ChangeType::Update,
                    next_content_hash: Some(sha256_hex(new_content.as_bytes())),
                    new_content: Some(new_content),
                    previous_content: Some(previous),
                    previous_content_hash: Some(disk_hash),
                    diff_bytes: diff_preview.len(),
                    diff_preview,
                }
            }
            ChangeType::Delete => {
                let (previous, disk_hash) = on_disk
                    .ok_or_else(|| SessionError::TargetMissing(normalized.clone()))?;
                if let Some(expected) = &change.old_content_hash {
                    if *expected != disk_hash {
                        return Err(SessionError::OptimisticLock {
                            path: normalized,
                            expected: expected.clone(),
                            actual: disk_hash,
                        });
                    }
                }
                let diff_preview = unified_diff(&normalized, &previous, "");
                StagedFileChange {
                    path: normalized.clone(),
                    change_type: ChangeType::Delete,
                    new_content: None,
                    next_content_hash: None,
                    previous_content: Some(previous),
                    previous_content_hash: Some(disk_hash),
                    diff_bytes: diff_preview.len(),
                    diff_preview,
                }
            }
        };

        active.changes.insert(normalized, staged);
        Ok(())
    }

    /// All staged changes, in path order.
    pub fn staged_diffs(&self) -> Vec<&StagedFileChange> {
        self.active
            .as_ref()
            .map(|t| t.changes.values().collect())
            .unwrap_or_default()
    }

    /// Enforce the step budgets and path policy over the staged set.
    pub fn validate_step(&self) -> SessionResult<()> {
        let active = self.active.as_ref().ok_or(SessionError::NoActiveStep)?;

        if active.changes.len() > self.options.max_files_per_step {
            return Err(SessionError::TooManyFiles {
                count: active.changes.len(),
                max: self.options.max_files_per_step,
            });
        }

        let total_diff: usize = active.changes.values().map(|c| c.diff_bytes).sum();
        if total_diff > self.options.max_total_diff_bytes {
            return Err(SessionError::DiffTooLarge {
                bytes: total_diff,
                max: self.options.max_total_diff_bytes,
            });
        }

        for change in active.changes.values() {
            if let Some(content) = &change.new_content {
                if content.len() > self.options.max_file_bytes {
                    return Err(SessionError::FileTooLarge {
                        path: change.path.clone(),
                        bytes: content.len(),
                        max: self.options.max_file_bytes,
                    });
                }
            }
            for prefix in &self.options.restricted_prefixes {
                if change.path.starts_with(prefix.as_str()) {
                    return Err(SessionError::RestrictedPath(change.path.clone()));
                }
            }
            let file_name = change.path.rsplit('/').next().unwrap_or(&change.path);
            if !self.options.allow_env_mutation && file_name.starts_with(".env") {
                return Err(SessionError::EnvMutationBlocked(change.path.clone()));
            }
        }

        Ok(())
    }

    /// Atomically apply the staged set.
    ///
    /// Re-checks every optimistic lock, snapshots backups, then writes and
    /// deletes in path order. Any failure restores every touched file; the
    /// tree ends byte-identical to pre-stage.
    pub fn apply_step_changes(&mut self) -> SessionResult<usize> {
        self.validate_step()?;

        // Re-check locks before mutating anything.
        let lock_checks: Vec<(String, ChangeType, Option<String>)> = {
            let active = self.active.as_ref().ok_or(SessionError::NoActiveStep)?;
            active
                .changes
                .values()
                .map(|c| (c.path.clone(), c.change_type, c.previous_content_hash.clone()))
                .collect()
        };
        for (path, change_type, expected) in &lock_checks {
            let on_disk = self.on_disk_hash(path)?;
            match (change_type, on_disk, expected) {
                (ChangeType::Create, Some(_), _) => {
                    return Err(SessionError::TargetExists(path.clone()))
                }
                (ChangeType::Create, None, _) => {}
                (_, None, _) => return Err(SessionError::TargetMissing(path.clone())),
                (_, Some((_, actual)), Some(expected)) if actual != *expected => {
                    return Err(SessionError::OptimisticLock {
                        path: path.clone(),
                        expected: expected.clone(),
                        actual,
                    })
                }
                _ => {}
            }
        }

        let active = self.active.as_mut().ok_or(SessionError::NoActiveStep)?;
        if active.phase != StepPhase::Staging {
            return Err(SessionError::WrongPhase {
                expected: StepPhase::Staging,
                actual: active.phase,
            });
        }

        // Snapshot backups of current on-disk state.
        active.backups = active
            .changes
            .values()
            .map(|c| (c.path.clone(), c.previous_content.clone()))
            .collect();

        let mut applied: Vec<String> = Vec::new();
        let mut failure: Option<SessionError> = None;

        for change in active.changes.values() {
            let absolute = self.project_root.join(&change.path);
            let result = match change.change_type {
                ChangeType::Create | ChangeType::Update => {
                    let content = change.new_content.as_deref().unwrap_or_default();
                    absolute
                        .parent()
                        .map(std::fs::create_dir_all)
                        .transpose()
                        .and_then(|_| std::fs::write(&absolute, content))
                }
                ChangeType::Delete => std::fs::remove_file(&absolute),
            };
            match result {
                Ok(()) => applied.push(change.path.clone()),
                Err(e) => {
                    failure = Some(io_err(&change.path, e));
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // Restore everything that was touched.
            for path in &applied {
                let backup = active.backups.get(path).cloned().flatten();
                let absolute = self.project_root.join(path);
                match backup {
                    Some(content) => {
                        let _ = std::fs::write(&absolute, content);
                    }
                    None => {
                        let _ = std::fs::remove_file(&absolute);
                    }
                }
            }
            active.phase = StepPhase::RolledBack;
            return Err(error);
        }

        active.phase = StepPhase::Applied;
        Ok(applied.len())
    }

    /// Create exactly one git commit for the applied step. On commit
    /// failure every backup is restored.
    pub fn commit_step(&mut self, meta: &StepCommitMeta) -> SessionResult<String> {
        let active = self.active.as_mut().ok_or(SessionError::NoActiveStep)?;
        if active.phase != StepPhase::Applied {
            return Err(SessionError::WrongPhase {
                expected: StepPhase::Applied,
                actual: active.phase,
            });
        }

        let message = meta.message();
        let commit = run_git(&self.project_root, &["add", "-A"])
            .and_then(|_| run_git(&self.project_root, &["commit", "-m", &message]))
            .and_then(|_| crate::worktree::current_commit(&self.project_root));

        match commit {
            Ok(hash) => {
                active.phase = StepPhase::Committed;
                let step_id = active.step_id.clone();
                let step_index = active.step_index;
                self.active = None;
                tracing::info!(
                    project_id = %self.project_id,
                    step_id = %step_id,
                    step_index,
                    commit = %hash,
                    "step committed"
                );
                Ok(hash)
            }
            Err(e) => {
                self.restore_backups();
                if let Some(active) = self.active.as_mut() {
                    active.phase = StepPhase::RolledBack;
                }
                self.active = None;
                Err(SessionError::Commit(e.to_string()))
            }
        }
    }

    /// Abort the active step. Applied-but-uncommitted changes are rolled
    /// back from backups.
    pub fn abort_step(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if active.phase == StepPhase::Applied {
            self.restore_backups();
        }
        self.active = None;
    }

    /// Drop any session state.
    pub fn clear(&mut self) {
        self.active = None;
    }

    pub fn has_active_step(&self) -> bool {
        self.active.is_some()
    }

    fn restore_backups(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        for (path, backup) in &active.backups {
            let absolute = self.project_root.join(path);
            match backup {
                Some(content) => {
                    if let Some(parent) = absolute.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let _ = std::fs::write(&absolute, content);
                }
                None => {
                    let _ = std::fs::remove_file(&absolute);
                }
            }
        }
    }
}
