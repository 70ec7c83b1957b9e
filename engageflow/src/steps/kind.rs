//! The closed set of analysis steps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::EngageflowError;

/// Every analysis step the engine knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StepKind {
    /// Detect and identify faces in the media.
    #[serde(rename = "face")]
    FaceRecognition,
    /// Extract overlay and in-image text.
    #[serde(rename = "ocr")]
    Ocr,
    /// Describe the media with a vision model.
    #[serde(rename = "visual")]
    VisualAnalysis,
    /// Sample frames of a video for labels, faces, text and scene cuts.
    #[serde(rename = "video")]
    VideoAnalysis,
    /// Transcribe the speech in a video's audio track.
    #[serde(rename = "audio")]
    AudioTranscription,
    /// Derive tags from caption and analysis results.
    #[serde(rename = "metadata")]
    MetadataTagging,
    /// Draft engagement comments from the analysis.
    #[serde(rename = "comments")]
    CommentGeneration,
}

impl StepKind {
    /// All step kinds, in default pipeline order.
    pub const ALL: [Self; 7] = [
        Self::FaceRecognition,
        Self::Ocr,
        Self::VisualAnalysis,
        Self::VideoAnalysis,
        Self::AudioTranscription,
        Self::MetadataTagging,
        Self::CommentGeneration,
    ];

    /// Stable key used in run state and task arguments.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::FaceRecognition => "face",
            Self::Ocr => "ocr",
            Self::VisualAnalysis => "visual",
            Self::VideoAnalysis => "video",
            Self::AudioTranscription => "audio",
            Self::MetadataTagging => "metadata",
            Self::CommentGeneration => "comments",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for StepKind {
    type Err = EngageflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key() == s)
            .ok_or_else(|| EngageflowError::UnknownStep(s.to_string()))
    }
}
