//! Run store: the durability capability the kernel consumes
//!
//! The kernel talks to a `RunStore` trait; the embedded `MemoryStore`
//! implements it with a single mutex guarding all state, which makes queue
//! claims transactional (the single-process analogue of
//! `SELECT … FOR UPDATE SKIP LOCKED`). Snapshots serialize to JSON so
//! crash-replay tests can persist and reload the whole store.

use crate::queue::{self, ClaimRequest, JobStatus, RunJob, WorkerNode};
use crate::run::{Run, StepRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("store lock poisoned")]
    LockPoisoned,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The durability capability set.
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: &Run) -> StoreResult<()>;
    fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>>;
    fn update_run(&self, run: &Run) -> StoreResult<()>;

    /// Compare-and-set acquisition of the run lock. Returns false when
    /// another owner currently holds it.
    fn try_acquire_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<bool>;
    fn release_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<()>;

    /// Append a step attempt. Records are immutable facts; there is no
    /// update operation.
    fn append_step_record(&self, record: &StepRecord) -> StoreResult<()>;
    fn step_records(&self, run_id: &str) -> StoreResult<Vec<StepRecord>>;
    /// Highest attempt for `(run_id, step_index)`, 0 when none exist.
    fn max_step_attempt(&self, run_id: &str, step_index: usize) -> StoreResult<u32>;

    fn enqueue_job(&self, job: &RunJob) -> StoreResult<()>;
    fn get_job(&self, job_id: &str) -> StoreResult<Option<RunJob>>;
    fn jobs_for_run(&self, run_id: &str) -> StoreResult<Vec<RunJob>>;
    /// Transactionally claim the oldest matching job, if any.
    fn claim_next_job(&self, request: &ClaimRequest, now: DateTime<Utc>)
        -> StoreResult<Option<RunJob>>;
    /// `claimed → running`, gated on the assigned node.
    fn mark_job_running(&self, job_id: &str, node_id: &str) -> StoreResult<bool>;
    /// Extend the lease iff the node still owns the job and it is active.
    fn renew_job_lease(
        &self,
        job_id: &str,
        node_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
    fn complete_job(&self, job_id: &str, node_id: &str) -> StoreResult<bool>;
    fn fail_job(&self, job_id: &str, node_id: &str, error: &str) -> StoreResult<bool>;

    fn upsert_worker(&self, node: &WorkerNode) -> StoreResult<()>;
    fn get_worker(&self, node_id: &str) -> StoreResult<Option<WorkerNode>>;
    fn mark_worker_offline(&self, node_id: &str) -> StoreResult<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    runs: BTreeMap<String, Run>,
    steps: Vec<StepRecord>,
    jobs: BTreeMap<String, RunJob>,
    workers: BTreeMap<String, WorkerNode>,
}

/// Embedded store. One mutex guards all state; claims are serialized.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked<T>(&self, f: impl FnOnce(&mut StoreState) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut guard)
    }

    /// Write the entire store as pretty JSON.
    pub fn persist_to(&self, path: &Path) -> StoreResult<()> {
        self.locked(|state| {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(state)?;
            std::fs::write(path, json)?;
            Ok(())
        })
    }

    /// Load a previously persisted snapshot.
    pub fn load_from(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let state: StoreState = serde_json::from_str(&contents)?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }
}

impl RunStore for MemoryStore {
    fn insert_run(&self, run: &Run) -> StoreResult<()> {
        self.locked(|state| {
            state.runs.insert(run.id.clone(), run.clone());
            Ok(())
        })
    }

    fn get_run(&self, run_id: &str) -> StoreResult<Option<Run>> {
        self.locked(|state| Ok(state.runs.get(run_id).cloned()))
    }

    fn update_run(&self, run: &Run) -> StoreResult<()> {
        self.locked(|state| {
            if !state.runs.contains_key(&run.id) {
                return Err(StoreError::RunNotFound(run.id.clone()));
            }
            state.runs.insert(run.id.clone(), run.clone());
            Ok(())
        })
    }

    fn try_acquire_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<bool> {
        self.locked(|state| {
            let run = state
                .runs
                .get_mut(run_id)
                .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
            match &run.run_lock_owner {
                Some(current) if current != owner => Ok(false),
                _ => {
                    run.run_lock_owner = Some(owner.to_string());
                    run.run_lock_acquired_at = Some(Utc::now());
                    Ok(true)
                }
            }
        })
    }

    fn release_run_lock(&self, run_id: &str, owner: &str) -> StoreResult<()> {
        self.locked(|state| {
            if let Some(run) = state.runs.get_mut(run_id) {
                if run.run_lock_owner.as_deref() == Some(owner) {
                    run.run_lock_owner = None;
                    run.run_lock_acquired_at = None;
                }
            }
            Ok(())
        })
    }

    fn append_step_record(&self, record: &StepRecord) -> StoreResult<()> {
        self.locked(|state| {
            state.steps.push(record.clone());
            Ok(())
        })
    }

    fn step_records(&self, run_id: &str) -> StoreResult<Vec<StepRecord>> {
        self.locked(|state| {
            let mut records: Vec<StepRecord> = state
                .steps
                .iter()
                .filter(|s| s.run_id == run_id)
                .cloned()
                .collect();
            records.sort_by(|a, b| {
                a.step_index
                    .cmp(&b.step_index)
                    .then(a.attempt.cmp(&b.attempt))
            });
            Ok(records)
        })
    }

    fn max_step_attempt(&self, run_id: &str, step_index: usize) -> StoreResult<u32> {
        self.locked(|state| {
            Ok(state
                .steps
                .iter()
                .filter(|s| s.run_id == run_id && s.step_index == step_index)
                .map(|s| s.attempt)
                .max()
                .unwrap_or(0))
        })
    }

    fn enqueue_job(&self, job: &RunJob) -> StoreResult<()> {
        self.locked(|state| {
            state.jobs.insert(job.id.clone(), job.clone());
            Ok(())
        })
    }

    fn get_job(&self, job_id: &str) -> StoreResult<Option<RunJob>> {
        self.locked(|state| Ok(state.jobs.get(job_id).cloned()))
    }

    fn jobs_for_run(&self, run_id: &str) -> StoreResult<Vec<RunJob>> {
        self.locked(|state| {
            let mut jobs: Vec<RunJob> = state
                .jobs
                .values()
                .filter(|j| j.run_id == run_id)
                .cloned()
                .collect();
            jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(jobs)
        })
    }

    fn claim_next_job(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RunJob>> {
        self.locked(|state| {
            let mut candidates: Vec<&String> = state
                .jobs
                .iter()
                .filter(|(_, job)| queue::claim_matches(job, request, now))
                .map(|(id, _)| id)
                .collect();
            candidates.sort_by_key(|id| state.jobs[*id].created_at);

            let Some(id) = candidates.first().map(|id| (*id).clone()) else {
                return Ok(None);
            };
            let job = state.jobs.get_mut(&id).expect("candidate id exists");
            queue::apply_claim(job, request, now);
            Ok(Some(job.clone()))
        })
    }

    fn mark_job_running(&self, job_id: &str, node_id: &str) -> StoreResult<bool> {
        self.locked(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            if job.status == JobStatus::Claimed && job.assigned_node.as_deref() == Some(node_id) {
                job.status = JobStatus::Running;
                job.updated_at = Utc::now();
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn renew_job_lease(
        &self,
        job_id: &str,
        node_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.locked(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            let active = matches!(job.status, JobStatus::Claimed | JobStatus::Running);
            if active && job.assigned_node.as_deref() == Some(node_id) {
                job.lease_expires_at = Some(now + chrono::Duration::seconds(lease_seconds));
                job.updated_at = now;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn complete_job(&self, job_id: &str, node_id: &str) -> StoreResult<bool> {
        self.locked(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            if job.status.is_terminal() || job.assigned_node.as_deref() != Some(node_id) {
                return Ok(false);
            }
            job.status = JobStatus::Complete;
            job.lease_expires_at = None;
            job.updated_at = Utc::now();
            Ok(true)
        })
    }

    fn fail_job(&self, job_id: &str, node_id: &str, error: &str) -> StoreResult<bool> {
        self.locked(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| StoreError::JobNotFound(job_id.to_string()))?;
            if job.status.is_terminal() || job.assigned_node.as_deref() != Some(node_id) {
                return Ok(false);
            }
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
            job.lease_expires_at = None;
            job.updated_at = Utc::now();
            Ok(true)
        })
    }

    fn upsert_worker(&self, node: &WorkerNode) -> StoreResult<()> {
        self.locked(|state| {
            state.workers.insert(node.node_id.clone(), node.clone());
            Ok(())
        })
    }

    fn get_worker(&self, node_id: &str) -> StoreResult<Option<WorkerNode>> {
        self.locked(|state| Ok(state.workers.get(node_id).cloned()))
    }

    fn mark_worker_offline(&self, node_id: &str) -> StoreResult<()> {
        self.locked(|state| {
            if let Some(node) = state.workers.get_mut(node_id) {
                node.status = crate::queue::WorkerStatus::Offline;
                node.last_heartbeat = Utc::now();
            }
            Ok(())
        })
    }
}
