//! Assertions over persisted run state.

use crate::core::{RunStatus, StepStatus};
use crate::state::PipelineRun;

/// Asserts the run's overall status.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run {} to be {expected}, got {}. Steps: {:?}",
        run.run_id,
        run.status,
        run.steps
            .iter()
            .map(|(name, s)| (name.as_str(), s.status))
            .collect::<Vec<_>>()
    );
}

/// Asserts a step's status.
pub fn assert_step_status(run: &PipelineRun, step: &str, expected: StepStatus) {
    let actual = run.step(step).map(|s| s.status);
    assert_eq!(
        actual,
        Some(expected),
        "Expected step '{step}' to be {expected}, got {actual:?}"
    );
}

/// Asserts a failed step's reason code.
pub fn assert_step_failed_with(run: &PipelineRun, step: &str, reason: &str) {
    assert_step_status(run, step, StepStatus::Failed);
    let actual = run.step(step).and_then(|s| s.failure_reason.as_deref());
    assert_eq!(
        actual,
        Some(reason),
        "Expected step '{step}' to fail with '{reason}', got {actual:?}"
    );
}

/// Asserts a field of a step's persisted result.
pub fn assert_step_result(run: &PipelineRun, step: &str, key: &str, expected: &serde_json::Value) {
    let actual = run
        .step(step)
        .and_then(|s| s.result.as_ref())
        .and_then(|r| r.get(key));
    assert_eq!(
        actual,
        Some(expected),
        "Expected result field '{key}' of step '{step}' to be {expected}"
    );
}
