//! End-to-end kernel scenarios: happy path, fork & resume, crash replay.

mod common;

use common::*;
use deeprun_kernel::contract::{ExecutionConfigOverride, ValidationMode};
use deeprun_kernel::run::{RunStatus, StepStatus};
use deeprun_kernel::store::RunStore;
use std::sync::Arc;

fn validation_off() -> ExecutionConfigOverride {
    ExecutionConfigOverride {
        light_validation_mode: Some(ValidationMode::Off),
        heavy_validation_mode: Some(ValidationMode::Off),
        ..Default::default()
    }
}

#[tokio::test]
async fn two_step_plan_completes() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![
        write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
        list_step("step-2", "src"),
    ]));
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(validation_off())))
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(run.current_step_index, 2);
    assert!(run.error_message.is_none());

    let records = store.step_records(&run.id).unwrap();
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.step_id, "step-1");
    assert_eq!(first.status, StepStatus::Completed);
    assert!(first.commit_hash.is_some(), "mutating step must commit");
    assert_eq!(first.attempt, 1);

    let second = &records[1];
    assert_eq!(second.step_id, "step-2");
    assert_eq!(second.status, StepStatus::Completed);
    assert!(second.commit_hash.is_none());

    // The commit advanced both commit cursors past the base.
    assert_ne!(run.current_commit_hash, None);
    assert_eq!(run.current_commit_hash, run.last_valid_commit_hash);
    assert_ne!(run.current_commit_hash, run.base_commit_hash);

    // The generated file landed in the run worktree, not the checkout.
    let worktree = run.worktree_path.as_ref().unwrap();
    assert!(worktree.contains(".deeprun/worktrees/"));
    assert!(std::path::Path::new(worktree).join("src/generated.ts").exists());
    assert!(!project.path().join("src/generated.ts").exists());
}

#[tokio::test]
async fn fork_and_resume() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![
        write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
        list_step("step-2", "src"),
    ]));
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(validation_off())))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Complete);

    // Fork at step-1: queued at index 1, based on step-1's commit.
    let fork = kernel.fork_run(&run.id, 1).unwrap();
    assert_eq!(fork.status, RunStatus::Queued);
    assert_eq!(fork.current_step_index, 1);
    let step1_commit = store.step_records(&run.id).unwrap()[0]
        .commit_hash
        .clone()
        .unwrap();
    assert_eq!(fork.base_commit_hash.as_deref(), Some(step1_commit.as_str()));

    // Output validation reports a worktree under the artifacts directory.
    let report = kernel.validate_run_output(&run.id).await.unwrap();
    assert!(report
        .worktree_path
        .as_ref()
        .unwrap()
        .contains(".deeprun/worktrees/"));

    // Resuming the fork completes the remaining step.
    let resumed = kernel.resume_run(&fork.id, None, false).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Complete);
    assert_eq!(resumed.current_step_index, 2);

    let fork_records = store.step_records(&fork.id).unwrap();
    assert_eq!(fork_records.len(), 1);
    assert_eq!(fork_records[0].step_index, 1);
    assert_eq!(fork_records[0].step_id, "step-2");
}

#[tokio::test]
async fn resume_with_mismatched_contract_is_rejected() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![list_step("step-1", "src")]));
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(validation_off())))
        .await
        .unwrap();

    // Mark failed so the run is resumable, then request a different config.
    let mut failed = store.get_run(&run.id).unwrap().unwrap();
    failed.status = RunStatus::Failed;
    store.update_run(&failed).unwrap();

    let mismatch = ExecutionConfigOverride {
        max_files_per_step: Some(3),
        ..Default::default()
    };
    let error = kernel
        .resume_run(&run.id, Some(mismatch.clone()), false)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("execution contract mismatch"));

    // The explicit override unlocks the resume.
    let resumed = kernel.resume_run(&run.id, Some(mismatch), true).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Complete);
}

#[tokio::test]
async fn crash_replay_appends_attempts() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![
        write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
        list_step("step-2", "src"),
    ]));
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(validation_off())))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Complete);

    let before = store.step_records(&run.id).unwrap();
    let original_step2 = before
        .iter()
        .find(|r| r.step_index == 1)
        .cloned()
        .unwrap();

    // Simulate a crash recorded as a mid-plan failure.
    let mut crashed = store.get_run(&run.id).unwrap().unwrap();
    crashed.status = RunStatus::Failed;
    crashed.current_step_index = 1;
    crashed.finished_at = None;
    store.update_run(&crashed).unwrap();

    let resumed = kernel.resume_run(&run.id, None, false).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Complete);
    assert_eq!(resumed.current_step_index, 2);

    let after = store.step_records(&run.id).unwrap();
    let step2_attempts: Vec<_> = after.iter().filter(|r| r.step_index == 1).collect();
    assert_eq!(step2_attempts.len(), 2);
    assert_eq!(step2_attempts[0].attempt, 1);
    assert_eq!(step2_attempts[1].attempt, 2);
    assert_eq!(step2_attempts[1].status, StepStatus::Completed);

    // The original record is preserved byte-for-byte.
    assert_eq!(
        serde_json::to_string(step2_attempts[0]).unwrap(),
        serde_json::to_string(&original_step2).unwrap()
    );
}

#[tokio::test]
async fn governance_decision_written_for_terminal_run() {
    let project = project();
    let planner = Arc::new(ScriptedPlanner::with_plan(vec![list_step("step-1", "src")]));
    let (kernel, _store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::passing()),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel
        .start_run(start_request(Some(validation_off())))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Complete);

    let decision_path = project
        .path()
        .join(".deeprun")
        .join("decisions")
        .join(format!("{}.json", run.id));
    assert!(decision_path.exists());

    let raw = std::fs::read_to_string(&decision_path).unwrap();
    let decision: deeprun_kernel::GovernanceDecision = serde_json::from_str(raw.trim()).unwrap();
    assert_eq!(decision.decision, deeprun_kernel::Decision::Pass);
    assert!(deeprun_kernel::governance::verify_decision_hash(&decision).unwrap());
}
