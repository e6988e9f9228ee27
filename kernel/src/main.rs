//! deeprun binary: worker daemon and stress harness
//!
//! `deeprun worker` runs a polling worker against the embedded store with
//! the fixture planner (provider-backed planners are wired by the hosting
//! service). `deeprun stress` runs a deterministic stress session and
//! prints the gate report.

use anyhow::Context;
use clap::{Parser, Subcommand};
use deeprun_kernel::stress::{self, StressConfig};
use deeprun_kernel::stress::fixtures::{FixturePlanner, FixtureProvider, PassingEngine, ScenarioKind};
use deeprun_kernel::worker::{Worker, WorkerConfig};
use deeprun_kernel::{executor::NoopProbe, Kernel, KernelDeps, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "deeprun", about = "Autonomous code-generation kernel", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker loop against a workspace (local harness mode).
    Worker {
        /// Target project repository root.
        #[arg(long)]
        workspace: PathBuf,
        /// Persist the embedded store under `<workspace>/.deeprun/state`.
        #[arg(long, default_value_t = true)]
        persist_store: bool,
    },
    /// Run a deterministic stress session and print the gate report.
    Stress {
        /// Session seed; the scenario sequence is a pure function of it.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Number of scenario runs in the session.
        #[arg(long, default_value_t = 8)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deeprun_kernel::telemetry::init_json();
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            workspace,
            persist_store,
        } => run_worker(workspace, persist_store).await,
        Commands::Stress { seed, runs } => run_stress(seed, runs).await,
    }
}

async fn run_worker(workspace: PathBuf, persist_store: bool) -> anyhow::Result<()> {
    let store_path = workspace.join(".deeprun").join("state").join("store.json");
    let store: Arc<MemoryStore> = if persist_store && store_path.exists() {
        Arc::new(MemoryStore::load_from(&store_path).context("loading persisted store")?)
    } else {
        Arc::new(MemoryStore::new())
    };

    let config = WorkerConfig::from_bas();
    let kernel = Arc::new(Kernel::new(KernelDeps {
        store: store.clone(),
        planner: Arc::new(FixturePlanner::new(ScenarioKind::HappyPath)),
        provider: Arc::new(FixtureProvider),
        probe: Arc::new(NoopProbe),
        engine: Arc::new(PassingEngine),
        workspace_root: workspace.clone(),
        node_id: config.node_id.clone(),
        inline_execution: false,
    }));
    let worker = Worker::new(kernel, config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await.context("worker loop")?;

    if persist_store {
        store
            .persist_to(&store_path)
            .context("persisting store snapshot")?;
    }
    Ok(())
}

async fn run_stress(seed: u64, runs: usize) -> anyhow::Result<()> {
    let config = StressConfig {
        session_seed: seed,
        runs,
        ..Default::default()
    };
    let summary = stress::run_stress_session(&config)
        .await
        .context("stress session")?;

    println!("{}", serde_json::to_string_pretty(&summary.report)?);
    for finding in &summary.report.findings {
        tracing::info!(
            gate = %finding.gate,
            triggered = finding.triggered,
            detail = %finding.detail,
            "gate evaluated"
        );
    }

    if summary.report.accepted {
        Ok(())
    } else {
        anyhow::bail!(
            "stress gates triggered: {}",
            summary
                .report
                .triggered()
                .iter()
                .map(|g| g.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}
