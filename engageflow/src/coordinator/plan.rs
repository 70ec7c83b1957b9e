//! Run plans: which steps a run executes and how.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::core::RunMode;
use crate::errors::EngageflowError;
use crate::state::{PipelineRun, RunOptions};
use crate::steps::{StepKind, StepRegistry, GENERATE_COMMENTS_FLAG};

/// Declares the steps of a run before it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    /// Steps whose failure fails the run.
    #[serde(default)]
    pub required: Vec<StepKind>,
    /// Awaited steps whose failure only produces warnings.
    #[serde(default)]
    pub optional: Vec<StepKind>,
    /// Steps enqueued once the run is finalized.
    #[serde(default)]
    pub deferred: Vec<StepKind>,
    /// Step enqueued once every analysis step settled.
    #[serde(default)]
    pub generation: Option<StepKind>,
    /// Parallel or chained launch.
    #[serde(default)]
    pub mode: RunMode,
    /// Feature toggles.
    #[serde(default)]
    pub task_flags: BTreeMap<String, Value>,
    /// Provider/model selection.
    #[serde(default)]
    pub options: RunOptions,
}

impl Default for RunPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl RunPlan {
    /// Creates an empty parallel plan.
    #[must_use]
    pub fn new() -> Self {
        Self {
            required: Vec::new(),
            optional: Vec::new(),
            deferred: Vec::new(),
            generation: None,
            mode: RunMode::Parallel,
            task_flags: BTreeMap::new(),
            options: RunOptions::default(),
        }
    }

    /// The usual post analysis: face, OCR and visual in parallel, comments
    /// once they settle, metadata tagging after finalization.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .required(StepKind::FaceRecognition)
            .required(StepKind::Ocr)
            .required(StepKind::VisualAnalysis)
            .generation(StepKind::CommentGeneration)
            .deferred(StepKind::MetadataTagging)
            .generate_comments(true)
    }

    /// Reel analysis: video frames required, transcription optional,
    /// comments and metadata as in [`RunPlan::standard`].
    #[must_use]
    pub fn video() -> Self {
        Self::new()
            .required(StepKind::VideoAnalysis)
            .optional(StepKind::AudioTranscription)
            .generation(StepKind::CommentGeneration)
            .deferred(StepKind::MetadataTagging)
            .generate_comments(true)
    }

    /// Adds a required step.
    #[must_use]
    pub fn required(mut self, kind: StepKind) -> Self {
        self.required.push(kind);
        self
    }

    /// Adds an optional step.
    #[must_use]
    pub fn optional(mut self, kind: StepKind) -> Self {
        self.optional.push(kind);
        self
    }

    /// Adds a deferred step.
    #[must_use]
    pub fn deferred(mut self, kind: StepKind) -> Self {
        self.deferred.push(kind);
        self
    }

    /// Sets the generation step.
    #[must_use]
    pub fn generation(mut self, kind: StepKind) -> Self {
        self.generation = Some(kind);
        self
    }

    /// Sets the launch mode.
    #[must_use]
    pub fn mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets a task flag.
    #[must_use]
    pub fn flag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.task_flags.insert(key.into(), value);
        self
    }

    /// Toggles comment generation.
    #[must_use]
    pub fn generate_comments(self, enabled: bool) -> Self {
        self.flag(GENERATE_COMMENTS_FLAG, Value::Bool(enabled))
    }

    /// Sets provider/model selection.
    #[must_use]
    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    fn generation_enabled(&self) -> bool {
        self.task_flags
            .get(GENERATE_COMMENTS_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Builds a validated run. The generation step is dropped when comment
    /// generation is disabled.
    pub fn build_run(
        &self,
        registry: &StepRegistry,
        run_id: &str,
        subject_id: &str,
    ) -> Result<PipelineRun, EngageflowError> {
        let generation = self.generation.filter(|_| self.generation_enabled());

        let mut seen = BTreeSet::new();
        let all = self
            .required
            .iter()
            .chain(&self.optional)
            .chain(&self.deferred)
            .chain(generation.iter());
        for kind in all {
            if !seen.insert(*kind) {
                return Err(EngageflowError::Config(format!(
                    "step '{kind}' appears more than once in the run plan"
                )));
            }
            if !registry.contains(*kind) {
                return Err(EngageflowError::UnknownStep(kind.to_string()));
            }
        }

        let mut awaited = self.required.iter().chain(&self.optional).chain(generation.iter());
        if self.required.is_empty() && self.optional.is_empty() {
            return Err(EngageflowError::Config(
                "run plan needs at least one required or optional step".into(),
            ));
        }
        let any_triggers = awaited.any(|kind| {
            registry
                .get(*kind)
                .is_some_and(|step| step.capabilities.triggers_finalize)
        });
        if !any_triggers {
            return Err(EngageflowError::Config(
                "no awaited step triggers finalization; the run could never finish".into(),
            ));
        }

        let mut run = PipelineRun::new(run_id, subject_id)
            .with_mode(self.mode)
            .with_options(self.options.clone());
        for kind in &self.required {
            run = run.with_required_step(kind.key());
        }
        for kind in &self.optional {
            run = run.with_optional_step(kind.key());
        }
        for kind in &self.deferred {
            run = run.with_deferred_step(kind.key());
        }
        if let Some(kind) = generation {
            run = run.with_generation_step(kind.key());
        }
        for (key, value) in &self.task_flags {
            run = run.with_flag(key.clone(), value.clone());
        }
        Ok(run)
    }
}
