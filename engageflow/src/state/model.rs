//! Typed pipeline run aggregate and its metadata blob encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::{RunMode, RunStatus, StepStatus};
use crate::errors::EngageflowError;
use crate::utils::{now_utc, Timestamp};

/// Key under which pipeline state lives inside a subject's metadata blob.
pub const PIPELINE_METADATA_KEY: &str = "ai_pipeline";

/// Provider/model selection carried by every task of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Inference provider (e.g. "local", "ollama").
    #[serde(default)]
    pub provider: Option<String>,
    /// Model name for the provider.
    #[serde(default)]
    pub model: Option<String>,
    /// Who or what triggered the run.
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// State of one named step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    /// Step name.
    pub step_name: String,
    /// Current status.
    pub status: StepStatus,
    /// Whether a failure of this step fails the whole run.
    #[serde(default)]
    pub required: bool,
    /// Queue the current task was placed on.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Identifier of the task currently responsible for the step.
    #[serde(default)]
    pub active_task_id: Option<String>,
    /// Resource-guard deferrals so far.
    #[serde(default)]
    pub attempts: u32,
    /// Readiness waits so far, across every wait reason.
    #[serde(default)]
    pub reason_waits: u32,
    /// When execution first started.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the step reached a terminal state.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// Projected result summary.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Truncated error message.
    #[serde(default)]
    pub error: Option<String>,
    /// Reason code of the failure.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// When the next deferred attempt is due.
    #[serde(default)]
    pub retry_after: Option<Timestamp>,
}

impl StepState {
    /// Creates a pending step.
    #[must_use]
    pub fn new(step_name: impl Into<String>, required: bool) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            required,
            queue_name: None,
            active_task_id: None,
            attempts: 0,
            reason_waits: 0,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            failure_reason: None,
            retry_after: None,
        }
    }

    /// Returns true once the step can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Marker recorded by the first step to open the generation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMarker {
    /// Step whose completion opened the phase.
    pub opened_by: String,
    /// When the phase was opened.
    pub started_at: Timestamp,
}

/// One execution attempt of the pipeline over one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Correlation token.
    pub run_id: String,
    /// Subject the run analyses.
    pub subject_id: String,
    /// Overall status.
    pub status: RunStatus,
    /// How awaited steps are launched.
    #[serde(default)]
    pub mode: RunMode,
    /// Steps that must succeed for a clean completion.
    #[serde(default)]
    pub required_steps: Vec<String>,
    /// Steps that are awaited but whose failure only produces warnings.
    #[serde(default)]
    pub optional_steps: Vec<String>,
    /// Steps enqueued only after finalization.
    #[serde(default)]
    pub deferred_steps: Vec<String>,
    /// Step gated on completion of every analysis step.
    #[serde(default)]
    pub generation_step: Option<String>,
    /// Feature toggles for optional behaviour.
    #[serde(default)]
    pub task_flags: BTreeMap<String, serde_json::Value>,
    /// Provider/model selection.
    #[serde(default)]
    pub options: RunOptions,
    /// Per-step state.
    #[serde(default)]
    pub steps: BTreeMap<String, StepState>,
    /// Generation continuation lock.
    #[serde(default)]
    pub generation: Option<GenerationMarker>,
    /// When deferred steps were handed to the queue.
    #[serde(default)]
    pub deferred_enqueued_at: Option<Timestamp>,
    /// Finalizer rollup.
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    /// Aggregated failure reason for failed runs.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// When the run was created.
    pub created_at: Timestamp,
    /// When the first step started.
    #[serde(default)]
    pub started_at: Option<Timestamp>,
    /// When the run was finalized.
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
    /// Last mutation time.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl PipelineRun {
    /// Creates a queued run with no steps.
    #[must_use]
    pub fn new(run_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            subject_id: subject_id.into(),
            status: RunStatus::Queued,
            mode: RunMode::Parallel,
            required_steps: Vec::new(),
            optional_steps: Vec::new(),
            deferred_steps: Vec::new(),
            generation_step: None,
            task_flags: BTreeMap::new(),
            options: RunOptions::default(),
            steps: BTreeMap::new(),
            generation: None,
            deferred_enqueued_at: None,
            summary: None,
            failure_reason: None,
            created_at: now_utc(),
            started_at: None,
            finished_at: None,
            updated_at: None,
        }
    }

    /// Declares a required step.
    #[must_use]
    pub fn with_required_step(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.steps.insert(name.clone(), StepState::new(&name, true));
        self.required_steps.push(name);
        self
    }

    /// Declares an optional (awaited, non-fatal) step.
    #[must_use]
    pub fn with_optional_step(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.steps.insert(name.clone(), StepState::new(&name, false));
        self.optional_steps.push(name);
        self
    }

    /// Declares a deferred step.
    #[must_use]
    pub fn with_deferred_step(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.steps.insert(name.clone(), StepState::new(&name, false));
        self.deferred_steps.push(name);
        self
    }

    /// Declares the generation step. It is required.
    #[must_use]
    pub fn with_generation_step(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.steps.insert(name.clone(), StepState::new(&name, true));
        self.generation_step = Some(name);
        self
    }

    /// Sets the launch mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets a task flag.
    #[must_use]
    pub fn with_flag(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.task_flags.insert(key.into(), value);
        self
    }

    /// Sets provider/model options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns true once the run has been finalized.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns a step's state.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.get(name)
    }

    /// Returns a mutable step state.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepState> {
        self.steps.get_mut(name)
    }

    /// Analysis steps: required then optional, in declaration order.
    pub fn analysis_steps(&self) -> impl Iterator<Item = &str> {
        self.required_steps
            .iter()
            .chain(self.optional_steps.iter())
            .map(String::as_str)
    }

    /// Every step that must be terminal before finalization.
    pub fn awaited_steps(&self) -> impl Iterator<Item = &str> {
        self.analysis_steps()
            .chain(self.generation_step.iter().map(String::as_str))
    }

    /// Returns true if a failure of the step fails the run.
    #[must_use]
    pub fn is_required(&self, name: &str) -> bool {
        self.required_steps.iter().any(|s| s == name)
            || self.generation_step.as_deref() == Some(name)
    }

    /// Returns true if the step runs only after finalization.
    #[must_use]
    pub fn is_deferred_step(&self, name: &str) -> bool {
        self.deferred_steps.iter().any(|s| s == name)
    }

    /// Returns true if the step is terminal. Unknown steps count as terminal.
    #[must_use]
    pub fn step_terminal(&self, name: &str) -> bool {
        self.step(name).map_or(true, StepState::is_terminal)
    }

    /// Awaited steps that have not reached a terminal state.
    #[must_use]
    pub fn steps_requiring_execution(&self) -> Vec<String> {
        self.awaited_steps()
            .filter(|name| !self.step_terminal(name))
            .map(str::to_string)
            .collect()
    }

    /// All failed steps, awaited first then deferred.
    #[must_use]
    pub fn failed_steps(&self) -> Vec<String> {
        self.awaited_steps()
            .chain(self.deferred_steps.iter().map(String::as_str))
            .filter(|name| {
                self.step(name)
                    .is_some_and(|s| s.status == StepStatus::Failed)
            })
            .map(str::to_string)
            .collect()
    }

    /// Failed steps whose failure fails the run.
    #[must_use]
    pub fn failed_required_steps(&self) -> Vec<String> {
        self.failed_steps()
            .into_iter()
            .filter(|name| self.is_required(name))
            .collect()
    }

    /// Returns true if every analysis step is terminal.
    #[must_use]
    pub fn analysis_settled(&self) -> bool {
        self.analysis_steps().all(|name| self.step_terminal(name))
    }

    /// The next analysis step in chain order that was never dispatched.
    #[must_use]
    pub fn next_pending_analysis_step(&self) -> Option<String> {
        self.analysis_steps()
            .find(|name| {
                self.step(name)
                    .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .map(str::to_string)
    }

    /// Reads a boolean task flag, defaulting to false.
    #[must_use]
    pub fn flag_enabled(&self, key: &str) -> bool {
        self.task_flags
            .get(key)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

/// The engine-owned section of a subject's metadata blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetadata {
    /// Runs keyed by run id.
    #[serde(default)]
    pub runs: BTreeMap<String, PipelineRun>,
    /// Most recently started run.
    #[serde(default)]
    pub latest_run_id: Option<String>,
}

impl PipelineMetadata {
    /// Decodes the engine section from a full metadata blob.
    pub fn from_blob(blob: &serde_json::Value) -> Result<Self, EngageflowError> {
        match blob.get(PIPELINE_METADATA_KEY) {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(section) => Ok(serde_json::from_value(section.clone())?),
        }
    }

    /// Writes the engine section into `blob`, preserving every other key.
    pub fn write_into(&self, blob: &mut serde_json::Value) -> Result<(), EngageflowError> {
        let section = serde_json::to_value(self)?;
        match blob {
            serde_json::Value::Object(map) => {
                map.insert(PIPELINE_METADATA_KEY.to_string(), section);
            }
            other => {
                let mut map = serde_json::Map::new();
                map.insert(PIPELINE_METADATA_KEY.to_string(), section);
                *other = serde_json::Value::Object(map);
            }
        }
        Ok(())
    }

    /// Drops the oldest terminal runs beyond `limit`. The latest run and
    /// runs still in flight are always kept.
    pub fn prune(&mut self, limit: usize) {
        if self.runs.len() <= limit {
            return;
        }
        let mut removable: Vec<(Timestamp, String)> = self
            .runs
            .values()
            .filter(|run| run.is_terminal())
            .filter(|run| self.latest_run_id.as_deref() != Some(run.run_id.as_str()))
            .map(|run| (run.created_at, run.run_id.clone()))
            .collect();
        removable.sort();

        let excess = self.runs.len() - limit;
        for (_, run_id) in removable.into_iter().take(excess) {
            self.runs.remove(&run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_run() -> PipelineRun {
        PipelineRun::new("run-1", "post-1")
            .with_required_step("face")
            .with_optional_step("ocr")
            .with_generation_step("comments")
            .with_deferred_step("metadata")
    }

    #[test]
    fn test_awaited_steps_order() {
        let run = sample_run();
        let awaited: Vec<&str> = run.awaited_steps().collect();
        assert_eq!(awaited, vec!["face", "ocr", "comments"]);
        assert_eq!(run.steps_requiring_execution(), vec!["face", "ocr", "comments"]);
    }

    #[test]
    fn test_required_classification() {
        let run = sample_run();
        assert!(run.is_required("face"));
        assert!(run.is_required("comments"));
        assert!(!run.is_required("ocr"));
        assert!(!run.is_required("metadata"));
        assert!(run.is_deferred_step("metadata"));
    }

    #[test]
    fn test_failed_steps_queries() {
        let mut run = sample_run();
        run.step_mut("face").unwrap().status = StepStatus::Failed;
        run.step_mut("ocr").unwrap().status = StepStatus::Failed;
        run.step_mut("comments").unwrap().status = StepStatus::Succeeded;

        assert_eq!(run.failed_steps(), vec!["face", "ocr"]);
        assert_eq!(run.failed_required_steps(), vec!["face"]);
        assert!(run.steps_requiring_execution().is_empty());
    }

    #[test]
    fn test_next_pending_analysis_step() {
        let mut run = sample_run();
        assert_eq!(run.next_pending_analysis_step().as_deref(), Some("face"));
        run.step_mut("face").unwrap().status = StepStatus::Queued;
        assert_eq!(run.next_pending_analysis_step().as_deref(), Some("ocr"));
    }

    #[test]
    fn test_flag_enabled() {
        let run = sample_run().with_flag("generate_comments", serde_json::json!(true));
        assert!(run.flag_enabled("generate_comments"));
        assert!(!run.flag_enabled("missing"));
    }

    #[test]
    fn test_metadata_blob_preserves_foreign_keys() {
        let mut blob = serde_json::json!({"caption_lang": "en"});
        let mut metadata = PipelineMetadata::from_blob(&blob).unwrap();
        assert!(metadata.runs.is_empty());

        metadata.runs.insert("run-1".into(), sample_run());
        metadata.latest_run_id = Some("run-1".into());
        metadata.write_into(&mut blob).unwrap();

        assert_eq!(blob["caption_lang"], "en");
        let decoded = PipelineMetadata::from_blob(&blob).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_write_into_non_object_blob() {
        let mut blob = serde_json::Value::Null;
        PipelineMetadata::default().write_into(&mut blob).unwrap();
        assert!(blob.get(PIPELINE_METADATA_KEY).is_some());
    }

    #[test]
    fn test_prune_keeps_latest_and_active_runs() {
        let mut metadata = PipelineMetadata::default();
        for i in 0..4 {
            let mut run = PipelineRun::new(format!("run-{i}"), "post-1");
            run.created_at = run.created_at + chrono::Duration::seconds(i);
            if i < 3 {
                run.status = RunStatus::Completed;
            }
            metadata.runs.insert(run.run_id.clone(), run);
        }
        metadata.latest_run_id = Some("run-2".into());

        metadata.prune(2);

        let kept: Vec<&String> = metadata.runs.keys().collect();
        assert_eq!(kept, vec!["run-2", "run-3"]);
    }
}
