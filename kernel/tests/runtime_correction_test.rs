//! Step-local runtime correction: empty corrections are fatal, budgets are
//! enforced, and a successful repair lets the verify step pass.

mod common;

use common::*;
use deeprun_kernel::contract::{ExecutionConfigOverride, ValidationMode};
use deeprun_kernel::executor::ProbeResult;
use deeprun_kernel::run::{RunStatus, StepStatus};
use deeprun_kernel::store::RunStore;
use std::sync::Arc;

fn overrides(max_runtime: u32) -> ExecutionConfigOverride {
    ExecutionConfigOverride {
        light_validation_mode: Some(ValidationMode::Off),
        heavy_validation_mode: Some(ValidationMode::Off),
        max_runtime_correction_attempts: Some(max_runtime),
        ..Default::default()
    }
}

#[tokio::test]
async fn empty_runtime_correction_is_fatal() {
    let project = project();
    let planner = Arc::new(
        ScriptedPlanner::with_plan(vec![verify_step("verify-1")])
            .push_runtime_correction(empty_correction_step("runtime-correction-1")),
    );
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::always_failing("Error: connect ECONNREFUSED")),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel.start_run(start_request(Some(overrides(2)))).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    let message = run.error_message.unwrap();
    assert!(
        message.contains("Correction step 'runtime-correction-1' produced no proposed changes"),
        "unexpected error message: {message}"
    );

    let records = store.step_records(&run.id).unwrap();
    let correction = records
        .iter()
        .find(|r| r.step_id == "runtime-correction-1")
        .expect("correction attempt recorded");
    assert_eq!(correction.status, StepStatus::Failed);
    assert!(correction.commit_hash.is_none());
    let telemetry = correction.correction_telemetry.as_ref().unwrap();
    assert_eq!(telemetry["classification"]["intent"], "runtime_boot");
}

#[tokio::test]
async fn runtime_correction_limit_reached() {
    let project = project();
    let planner = Arc::new(
        ScriptedPlanner::with_plan(vec![verify_step("verify-1")]).runtime_template(|attempt| {
            write_step(
                &format!("runtime-correction-{attempt}"),
                &format!("src/runtime-fix-{attempt}.ts"),
                &format!("export const fix = {attempt};\n"),
            )
        }),
    );
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(ScriptedProbe::always_failing("Error: listen EADDRINUSE")),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel.start_run(start_request(Some(overrides(2)))).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error_message.as_deref(),
        Some("Runtime correction limit reached (2/2).")
    );

    let records = store.step_records(&run.id).unwrap();
    let completed_corrections: Vec<_> = records
        .iter()
        .filter(|r| r.step_id.starts_with("runtime-correction-") && r.status == StepStatus::Completed)
        .collect();
    assert_eq!(completed_corrections.len(), 2, "exactly two corrections committed");
    assert!(completed_corrections.iter().all(|r| r.commit_hash.is_some()));
}

#[tokio::test]
async fn runtime_correction_recovers() {
    let project = project();
    let planner = Arc::new(
        ScriptedPlanner::with_plan(vec![
            write_step("step-1", "src/generated.ts", "export const generated = 1;\n"),
            verify_step("verify-1"),
        ])
        .runtime_template(|attempt| {
            write_step(
                &format!("runtime-correction-{attempt}"),
                "src/runtime-fix.ts",
                "export const fixed = true;\n",
            )
        }),
    );
    // Fails once, then the repaired service boots.
    let probe = ScriptedProbe::passing()
        .push(ProbeResult::failed("Error: connect ECONNREFUSED"))
        .push(ProbeResult::passed());
    let (kernel, store) = kernel_with(
        project.path(),
        planner,
        Arc::new(probe),
        Arc::new(ScriptedEngine::passing()),
    );

    let run = kernel.start_run(start_request(Some(overrides(3)))).await.unwrap();

    assert_eq!(run.status, RunStatus::Complete);
    // write + correction + shifted verify: three plan slots consumed.
    assert_eq!(run.current_step_index, 3);

    let records = store.step_records(&run.id).unwrap();
    let verify_attempts: Vec<_> = records.iter().filter(|r| r.step_id == "verify-1").collect();
    assert_eq!(verify_attempts.len(), 2);
    assert_eq!(verify_attempts[0].status, StepStatus::Failed);
    assert_eq!(verify_attempts[0].runtime_status.as_deref(), Some("failed"));
    assert_eq!(verify_attempts[1].status, StepStatus::Completed);

    let correction = records
        .iter()
        .find(|r| r.step_id == "runtime-correction-1")
        .unwrap();
    assert_eq!(correction.status, StepStatus::Completed);
    assert!(correction.commit_hash.is_some());
}
