//! The contract every analysis step implements.

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::kind::StepKind;
use crate::errors::StepError;
use crate::queue::StepTaskArgs;
use crate::state::PipelineRun;
use crate::subject::SubjectRecord;

/// Everything a step sees while running.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Subject snapshot loaded for this attempt.
    pub subject: SubjectRecord,
    /// Run snapshot loaded for this attempt.
    pub run: PipelineRun,
    /// Task arguments of the current delivery.
    pub args: StepTaskArgs,
}

impl StepContext {
    /// Provider requested for the run.
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.args
            .provider
            .as_deref()
            .or(self.run.options.provider.as_deref())
    }

    /// Model requested for the run.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.args.model.as_deref().or(self.run.options.model.as_deref())
    }

    /// Result of a step that already succeeded in this run.
    #[must_use]
    pub fn step_result(&self, step: &str) -> Option<&Value> {
        self.run
            .step(step)
            .filter(|state| state.status == crate::core::StepStatus::Succeeded)
            .and_then(|state| state.result.as_ref())
    }
}

/// Decision taken before any resources are requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    /// Run the step.
    Proceed,
    /// Not this delivery's business; return without touching state.
    Abort {
        /// Why the delivery was dropped.
        reason: String,
    },
    /// Nothing to do; the step is recorded as succeeded-and-skipped.
    Skip {
        /// Why the step has nothing to do.
        reason: String,
    },
    /// The step cannot run; record a failure.
    Fail {
        /// Reason code.
        reason: String,
        /// Description.
        message: String,
    },
}

impl Preflight {
    /// Creates an abort decision.
    #[must_use]
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    /// Creates a skip decision.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Creates a failing decision.
    #[must_use]
    pub fn fail(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Raw output of a step's work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Structured output, possibly large.
    pub data: Map<String, Value>,
}

impl StepOutput {
    /// Creates an empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns a field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Default projection: scalars are kept, arrays become `<key>_count` and
    /// nested objects are dropped.
    #[must_use]
    pub fn summary(&self) -> Value {
        let mut projected = Map::new();
        for (key, value) in &self.data {
            match value {
                Value::Array(items) => {
                    projected.insert(format!("{key}_count"), Value::from(items.len()));
                }
                Value::Object(_) => {}
                scalar => {
                    projected.insert(key.clone(), scalar.clone());
                }
            }
        }
        Value::Object(projected)
    }
}

/// An analysis step.
///
/// Only [`perform`](StepHandler::perform) is mandatory; the remaining hooks
/// have defaults suitable for most steps.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Which step this handler runs.
    fn kind(&self) -> StepKind;

    /// Cheap checks that need no resources.
    async fn preflight(&self, _ctx: &StepContext) -> Preflight {
        Preflight::Proceed
    }

    /// Does the work.
    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;

    /// Projects the output into the summary persisted in run state.
    fn completion_result(&self, output: &StepOutput) -> Value {
        output.summary()
    }

    /// Whether the task should be redelivered after this error.
    fn is_retryable(&self, error: &StepError) -> bool {
        error.is_transient()
    }
}
