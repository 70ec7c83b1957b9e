//! Declared execution properties of a step.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::kind::StepKind;

/// What the executor needs to know about a step before running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCapabilities {
    /// Which step this describes.
    pub kind: StepKind,
    /// Name the resource guard meters this step under. Steps sharing a
    /// backend share a name.
    pub resource_task_name: String,
    /// Queue the step's tasks are placed on.
    pub queue_name: String,
    /// Hard deadline for the work itself.
    #[serde(default, with = "optional_seconds")]
    pub timeout: Option<Duration>,
    /// Guard deferrals allowed before failing with `resource_constraints`.
    pub max_defer_attempts: u32,
    /// Overrides the executor-wide delivery budget.
    #[serde(default)]
    pub max_total_attempts: Option<u32>,
    /// Whether completing this step checks if the run can be finalized.
    pub triggers_finalize: bool,
    /// Critical steps bypass soft throttling.
    #[serde(default)]
    pub critical: bool,
}

impl StepCapabilities {
    /// Built-in defaults for a step kind.
    #[must_use]
    pub fn for_kind(kind: StepKind) -> Self {
        let (resource, queue, timeout, defers) = match kind {
            StepKind::FaceRecognition => ("face_recognition", "ai_face", Some(120), 6),
            StepKind::Ocr => ("ocr", "ai_ocr", Some(90), 6),
            StepKind::VisualAnalysis => ("llm_inference", "ai_llm", Some(300), 8),
            StepKind::VideoAnalysis => ("video_analysis", "ai_video", Some(600), 6),
            StepKind::AudioTranscription => ("transcription", "ai_audio", Some(300), 6),
            StepKind::MetadataTagging => ("metadata", "ai_light", None, 3),
            StepKind::CommentGeneration => ("llm_inference", "ai_llm", Some(300), 8),
        };
        Self {
            kind,
            resource_task_name: resource.to_string(),
            queue_name: queue.to_string(),
            timeout: timeout.map(Duration::from_secs),
            max_defer_attempts: defers,
            max_total_attempts: None,
            triggers_finalize: true,
            critical: false,
        }
    }

    /// Sets the queue.
    #[must_use]
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Sets or clears the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the deferral budget.
    #[must_use]
    pub fn with_max_defer_attempts(mut self, attempts: u32) -> Self {
        self.max_defer_attempts = attempts;
        self
    }

    /// Sets the delivery budget.
    #[must_use]
    pub fn with_max_total_attempts(mut self, attempts: u32) -> Self {
        self.max_total_attempts = Some(attempts);
        self
    }

    /// Sets whether completion checks for finalization.
    #[must_use]
    pub fn with_triggers_finalize(mut self, triggers: bool) -> Self {
        self.triggers_finalize = triggers;
        self
    }

    /// Marks the step as critical.
    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

mod optional_seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_steps_share_a_resource() {
        let visual = StepCapabilities::for_kind(StepKind::VisualAnalysis);
        let comments = StepCapabilities::for_kind(StepKind::CommentGeneration);
        assert_eq!(visual.resource_task_name, comments.resource_task_name);
        assert_eq!(visual.queue_name, "ai_llm");
    }

    #[test]
    fn test_media_steps_get_their_own_queues() {
        let video = StepCapabilities::for_kind(StepKind::VideoAnalysis);
        let audio = StepCapabilities::for_kind(StepKind::AudioTranscription);
        assert_eq!(video.queue_name, "ai_video");
        assert_eq!(video.timeout, Some(Duration::from_secs(600)));
        assert_eq!(audio.resource_task_name, "transcription");
        assert_ne!(video.resource_task_name, audio.resource_task_name);
    }

    #[test]
    fn test_serde_timeout_in_seconds() {
        let caps = StepCapabilities::for_kind(StepKind::Ocr);
        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value["timeout"], 90);

        let decoded: StepCapabilities = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, caps);
    }

    #[test]
    fn test_builders() {
        let caps = StepCapabilities::for_kind(StepKind::MetadataTagging)
            .with_timeout(Some(Duration::from_secs(5)))
            .with_triggers_finalize(false)
            .with_critical(true);
        assert_eq!(caps.timeout, Some(Duration::from_secs(5)));
        assert!(!caps.triggers_finalize);
        assert!(caps.critical);
    }
}
