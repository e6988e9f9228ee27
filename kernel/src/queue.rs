//! Durable job queue types and lease semantics
//!
//! Jobs are claimed with an exclusive lease; a worker renews while it holds
//! the job and any job whose lease expires becomes claimable again. Claim
//! atomicity is the store's responsibility; the rules live here as pure
//! helpers so every store implementation enforces the same semantics.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Kernel,
    Validation,
    Evaluation,
}

/// Worker pool a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetRole {
    Compute,
    Eval,
}

impl TargetRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compute" => Some(Self::Compute),
            "eval" => Some(Self::Eval),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Eval => write!(f, "eval"),
        }
    }
}

/// Job lifecycle. `complete` and `failed` are terminal; `running → claimed`
/// is the lease-expiry reclaim edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Claimed,
    Running,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A unit of work for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub id: String,
    pub run_id: String,
    pub job_type: JobType,
    pub target_role: TargetRole,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunJob {
    pub fn new(run_id: impl Into<String>, job_type: JobType, target_role: TargetRole) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            job_type,
            target_role,
            status: JobStatus::Queued,
            assigned_node: None,
            lease_expires_at: None,
            attempt_count: 0,
            required_capabilities: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.required_capabilities = capabilities;
        self
    }
}

/// A worker claiming work.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub node_id: String,
    pub target_role: TargetRole,
    pub worker_capabilities: Vec<String>,
    pub lease_seconds: i64,
}

/// Whether every required capability is present in the worker's set.
pub fn capabilities_subset(required: &[String], offered: &[String]) -> bool {
    required.iter().all(|cap| offered.contains(cap))
}

/// A job is claimable when it is queued, or when its lease has lapsed while
/// claimed/running (the reclaim edge).
pub fn is_claimable(job: &RunJob, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Queued => job
            .lease_expires_at
            .map(|expiry| expiry <= now)
            .unwrap_or(true),
        JobStatus::Claimed | JobStatus::Running => {
            job.lease_expires_at.map(|expiry| expiry <= now).unwrap_or(false)
        }
        JobStatus::Complete | JobStatus::Failed => false,
    }
}

/// Whether a claim request matches a job (role + capabilities + lease).
pub fn claim_matches(job: &RunJob, request: &ClaimRequest, now: DateTime<Utc>) -> bool {
    job.target_role == request.target_role
        && capabilities_subset(&job.required_capabilities, &request.worker_capabilities)
        && is_claimable(job, now)
}

/// Apply a successful claim to a job row.
pub fn apply_claim(job: &mut RunJob, request: &ClaimRequest, now: DateTime<Utc>) {
    job.status = JobStatus::Claimed;
    job.assigned_node = Some(request.node_id.clone());
    job.lease_expires_at = Some(now + Duration::seconds(request.lease_seconds));
    job.attempt_count += 1;
    job.updated_at = now;
}

/// Worker availability state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

/// Heartbeat registry row for a worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: String,
    pub role: TargetRole,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl WorkerNode {
    pub fn online(node_id: impl Into<String>, role: TargetRole, capabilities: Vec<String>) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            capabilities,
            last_heartbeat: Utc::now(),
            status: WorkerStatus::Online,
        }
    }
}
