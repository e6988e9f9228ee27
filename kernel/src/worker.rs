//! Worker: claims jobs, renews leases, drives the kernel
//!
//! One worker process per node, one job at a time. The worker heartbeats
//! its registry row, polls for role-matching jobs, and keeps the lease on
//! a claimed job alive at half the lease period while the kernel runs it.

use crate::bas;
use crate::errors::KernelResult;
use crate::kernel::Kernel;
use crate::queue::{ClaimRequest, RunJob, TargetRole, WorkerNode};
use crate::store::RunStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Worker configuration, read from the declared environment surface.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub node_id: String,
    pub role: TargetRole,
    pub capabilities: Vec<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_seconds: i64,
}

impl WorkerConfig {
    pub fn from_bas() -> Self {
        let read = |key: &str| bas::read_non_empty(key).ok().flatten();
        Self {
            node_id: read("NODE_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            role: read("NODE_ROLE")
                .and_then(|v| TargetRole::parse(&v))
                .unwrap_or(TargetRole::Compute),
            capabilities: read("WORKER_CAPABILITIES")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            poll_interval: Duration::from_millis(
                bas::read_u64("WORKER_POLL_MS").ok().flatten().unwrap_or(2_000),
            ),
            heartbeat_interval: Duration::from_millis(
                bas::read_u64("WORKER_HEARTBEAT_MS")
                    .ok()
                    .flatten()
                    .unwrap_or(10_000),
            ),
            lease_seconds: bas::read_u64("WORKER_JOB_LEASE_SECONDS")
                .ok()
                .flatten()
                .unwrap_or(120) as i64,
        }
    }

    fn claim_request(&self) -> ClaimRequest {
        ClaimRequest {
            node_id: self.node_id.clone(),
            target_role: self.role,
            worker_capabilities: self.capabilities.clone(),
            lease_seconds: self.lease_seconds,
        }
    }
}

/// A worker bound to one kernel and store.
pub struct Worker {
    kernel: Arc<Kernel>,
    store: Arc<dyn RunStore>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(kernel: Arc<Kernel>, config: WorkerConfig) -> Self {
        let store = kernel.store();
        Self {
            kernel,
            store,
            config,
        }
    }

    /// Run until `shutdown` flips true. Marks the node offline on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> KernelResult<()> {
        self.store.upsert_worker(&WorkerNode::online(
            &self.config.node_id,
            self.config.role,
            self.config.capabilities.clone(),
        ))?;
        tracing::info!(
            node_id = %self.config.node_id,
            role = %self.config.role,
            "worker online"
        );

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.store.upsert_worker(&WorkerNode::online(
                        &self.config.node_id,
                        self.config.role,
                        self.config.capabilities.clone(),
                    ))?;
                }
                _ = poll.tick() => {
                    if let Some(job) = self.store.claim_next_job(&self.config.claim_request(), Utc::now())? {
                        self.process(job).await?;
                    }
                }
            }
        }

        self.store.mark_worker_offline(&self.config.node_id)?;
        tracing::info!(node_id = %self.config.node_id, "worker offline");
        Ok(())
    }

    /// Execute one claimed job with lease renewal at half the lease period.
    async fn process(&self, job: RunJob) -> KernelResult<()> {
        tracing::info!(job_id = %job.id, run_id = %job.run_id, "job claimed");
        self.store.mark_job_running(&job.id, &self.config.node_id)?;

        let renewal = self.spawn_lease_renewal(&job);
        let result = self.kernel.execute_run_job(&job).await;
        renewal.abort();

        match result {
            Ok(run) => {
                self.store.complete_job(&job.id, &self.config.node_id)?;
                tracing::info!(
                    job_id = %job.id,
                    run_id = %run.id,
                    status = %run.status,
                    "job complete"
                );
            }
            Err(error) => {
                self.store
                    .fail_job(&job.id, &self.config.node_id, &error.to_string())?;
                tracing::warn!(job_id = %job.id, error = %error, "job failed");
            }
        }
        Ok(())
    }

    fn spawn_lease_renewal(&self, job: &RunJob) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let job_id = job.id.clone();
        let node_id = self.config.node_id.clone();
        let lease_seconds = self.config.lease_seconds;
        let period = Duration::from_secs((lease_seconds.max(2) as u64) / 2);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                match store.renew_job_lease(&job_id, &node_id, lease_seconds, Utc::now()) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(job_id = %job_id, "lease renewal rejected; job reclaimed");
                        break;
                    }
                    Err(error) => {
                        tracing::warn!(job_id = %job_id, error = %error, "lease renewal error");
                        break;
                    }
                }
            }
        })
    }
}
