//! Dirty-worktree recovery: out-of-band commits and uncommitted edits are
//! discarded on resume, restoring the last valid commit.

mod common;

use common::*;
use deeprun_kernel::contract::{ExecutionConfigOverride, ValidationMode};
use deeprun_kernel::run::RunStatus;
use deeprun_kernel::store::RunStore;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

fn git(dir: &Path, args: &[&str]) {
    Command::new("git").args(args).current_dir(dir).output().unwrap();
}

#[tokio::test]
async fn dirty_worktree_is_reset_on_resume() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![list_step("step-1", "src")]));
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(ExecutionConfigOverride {
            light_validation_mode: Some(ValidationMode::Off),
            heavy_validation_mode: Some(ValidationMode::Off),
            ..Default::default()
        })))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Complete);

    // No mutating steps ran: last valid is still the base commit.
    let base = run.base_commit_hash.clone().unwrap();
    assert_eq!(run.last_valid_commit_hash.as_deref(), Some(base.as_str()));

    // Sabotage the worktree: a hand-written file, a rogue commit, then a
    // dirty re-edit of the same file.
    let worktree = Path::new(run.worktree_path.as_ref().unwrap()).to_path_buf();
    std::fs::write(worktree.join("rogue.txt"), "handwritten").unwrap();
    git(&worktree, &["add", "-A"]);
    git(&worktree, &["commit", "-m", "rogue commit"]);
    std::fs::write(worktree.join("rogue.txt"), "dirty again").unwrap();

    // Mark the run failed so it is resumable.
    let mut crashed = store.get_run(&run.id).unwrap().unwrap();
    crashed.status = RunStatus::Failed;
    crashed.current_step_index = 0;
    crashed.finished_at = None;
    store.update_run(&crashed).unwrap();

    let resumed = kernel.resume_run(&run.id, None, false).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Complete);

    // Recovery restored the last valid commit and dropped the rogue work.
    assert_eq!(resumed.current_commit_hash.as_deref(), Some(base.as_str()));
    assert!(!worktree.join("rogue.txt").exists());

    // Replay attempts never saw the rogue path.
    let records = store.step_records(&run.id).unwrap();
    let replay = records.last().unwrap();
    let files = serde_json::to_string(&replay.output_payload).unwrap();
    assert!(!files.contains("rogue.txt"));
}
