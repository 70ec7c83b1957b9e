//! Finalizer rollup of a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{RunStatus, StepStatus};
use crate::errors::EngageflowError;
use crate::state::{PipelineRun, StepState};
use crate::utils::{elapsed_ms, now_utc};

/// Per-step line of a [`PipelineSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    /// Final status.
    pub status: StepStatus,
    /// Whether the step's failure fails the run.
    pub required: bool,
    /// Whether preflight found nothing to do.
    #[serde(default)]
    pub skipped: bool,
    /// Deferred attempts recorded.
    pub attempts: u32,
    /// Wall time between start and settlement.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Reason code for failed steps.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl StepSummary {
    fn from_state(state: &StepState, required: bool) -> Self {
        let skipped = state
            .result
            .as_ref()
            .and_then(|r| r.get("skipped"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Self {
            status: state.status,
            required,
            skipped,
            attempts: state.attempts,
            duration_ms: elapsed_ms(state.started_at.as_ref(), state.finished_at.as_ref()),
            failure_reason: state.failure_reason.clone(),
        }
    }
}

/// Overall outcome of a finalized run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct PipelineSummary {
    pub run_id: String,
    pub subject_id: String,
    pub status: RunStatus,
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_steps: Vec<String>,
    pub failed_required_steps: Vec<String>,
    /// Steps that only start after finalization.
    pub deferred_steps: Vec<String>,
    pub steps: BTreeMap<String, StepSummary>,
    /// Time from run creation to finalization.
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// `step:reason` of the first failed required step.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl PipelineSummary {
    /// Rolls up the awaited steps of a run.
    ///
    /// A failed required step fails the run; failed optional steps only
    /// downgrade it to `completed_with_warnings`.
    #[must_use]
    pub fn from_run(run: &PipelineRun) -> Self {
        let mut steps = BTreeMap::new();
        for name in run.awaited_steps() {
            if let Some(state) = run.step(name) {
                steps.insert(
                    name.to_string(),
                    StepSummary::from_state(state, run.is_required(name)),
                );
            }
        }

        let failed_required_steps: Vec<String> = run
            .failed_required_steps()
            .into_iter()
            .filter(|name| !run.is_deferred_step(name))
            .collect();
        let failed_steps: Vec<String> = steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .map(|(name, _)| name.clone())
            .collect();

        let status = if !failed_required_steps.is_empty() {
            RunStatus::Failed
        } else if !failed_steps.is_empty() {
            RunStatus::CompletedWithWarnings
        } else {
            RunStatus::Completed
        };

        let failure_reason = failed_required_steps.first().map(|name| {
            let reason = run
                .step(name)
                .and_then(|s| s.failure_reason.as_deref())
                .unwrap_or("unknown");
            format!("{name}:{reason}")
        });

        let succeeded = steps
            .values()
            .filter(|s| s.status == StepStatus::Succeeded && !s.skipped)
            .count();
        let skipped = steps.values().filter(|s| s.skipped).count();
        let now = now_utc();

        Self {
            run_id: run.run_id.clone(),
            subject_id: run.subject_id.clone(),
            status,
            total_steps: steps.len(),
            succeeded,
            failed: failed_steps.len(),
            skipped,
            failed_steps,
            failed_required_steps,
            deferred_steps: run.deferred_steps.clone(),
            steps,
            duration_ms: elapsed_ms(Some(&run.created_at), Some(&now)),
            failure_reason,
        }
    }

    /// Returns the summary as the details object persisted on the run.
    pub fn to_value(&self) -> Result<serde_json::Value, EngageflowError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn run() -> PipelineRun {
        PipelineRun::new("run-1", "post-1")
            .with_required_step("face")
            .with_required_step("ocr")
            .with_optional_step("visual")
            .with_deferred_step("metadata")
    }

    fn settle(run: &mut PipelineRun, name: &str, status: StepStatus, reason: Option<&str>) {
        let step = run.step_mut(name).unwrap();
        step.status = status;
        step.failure_reason = reason.map(str::to_string);
        step.started_at = Some(now_utc());
        step.finished_at = step.started_at;
    }

    #[test]
    fn test_all_succeeded() {
        let mut run = run();
        for name in ["face", "ocr", "visual"] {
            settle(&mut run, name, StepStatus::Succeeded, None);
        }
        let summary = PipelineSummary::from_run(&run);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.deferred_steps, vec!["metadata"]);
        assert_eq!(summary.steps["face"].duration_ms, Some(0));
        assert!(summary.failure_reason.is_none());
    }

    #[test]
    fn test_optional_failure_warns() {
        let mut run = run();
        settle(&mut run, "face", StepStatus::Succeeded, None);
        settle(&mut run, "ocr", StepStatus::Succeeded, None);
        settle(&mut run, "visual", StepStatus::Failed, Some("timeout"));

        let summary = PipelineSummary::from_run(&run);
        assert_eq!(summary.status, RunStatus::CompletedWithWarnings);
        assert_eq!(summary.failed_steps, vec!["visual"]);
        assert!(summary.failed_required_steps.is_empty());
    }

    #[test]
    fn test_required_failure_fails() {
        let mut run = run();
        settle(&mut run, "face", StepStatus::Failed, Some("resource_constraints"));
        settle(&mut run, "ocr", StepStatus::Succeeded, None);
        settle(&mut run, "visual", StepStatus::Failed, Some("timeout"));

        let summary = PipelineSummary::from_run(&run);
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.failed_required_steps, vec!["face"]);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failure_reason.as_deref(), Some("face:resource_constraints"));
        assert_eq!(summary.to_value().unwrap()["failure_reason"], "face:resource_constraints");
    }

    #[test]
    fn test_skipped_steps_counted_separately() {
        let mut run = run();
        for name in ["face", "ocr", "visual"] {
            settle(&mut run, name, StepStatus::Succeeded, None);
        }
        run.step_mut("ocr").unwrap().result = Some(json!({"skipped": true, "reason": "x"}));

        let summary = PipelineSummary::from_run(&run);
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.skipped, 1);
        assert!(summary.steps["ocr"].skipped);
    }
}
