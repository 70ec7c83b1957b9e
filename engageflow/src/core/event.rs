//! Pipeline event type emitted on every state transition.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A structured event describing a pipeline or step transition.
///
/// Events are an outbound side effect only; the engine never reads them back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// The event name (e.g., "step.succeeded", "pipeline.finished").
    #[serde(rename = "event")]
    pub event_type: String,

    /// Progress indicator in the 0..=100 range.
    pub progress: u8,

    /// Human readable message.
    pub message: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// Additional structured details.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl PipelineEvent {
    /// Creates a new event. Progress values above 100 are clamped.
    #[must_use]
    pub fn new(event_type: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            progress: progress.min(100),
            message: message.into(),
            timestamp: crate::utils::iso_timestamp(),
            details: HashMap::new(),
        }
    }

    /// Adds a detail field to the event.
    #[must_use]
    pub fn add_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Adds the run correlation fields.
    #[must_use]
    pub fn for_run(self, subject_id: &str, run_id: &str) -> Self {
        self.add_detail("subject_id", serde_json::json!(subject_id))
            .add_detail("run_id", serde_json::json!(run_id))
    }

    /// Creates a "step.<status>" event.
    #[must_use]
    pub fn step(status: &str, step: &str, progress: u8) -> Self {
        Self::new(
            format!("step.{status}"),
            progress,
            format!("Step {step} {status}"),
        )
        .add_detail("step", serde_json::json!(step))
    }

    /// Creates a "pipeline.started" event.
    #[must_use]
    pub fn pipeline_started(step_count: usize) -> Self {
        Self::new(
            "pipeline.started",
            0,
            format!("Pipeline started with {step_count} steps"),
        )
        .add_detail("step_count", serde_json::json!(step_count))
    }

    /// Creates a "pipeline.finished" event.
    #[must_use]
    pub fn pipeline_finished(status: &str) -> Self {
        Self::new("pipeline.finished", 100, format!("Pipeline finished: {status}"))
            .add_detail("status", serde_json::json!(status))
    }
}
