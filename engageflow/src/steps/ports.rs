//! Inference backends the built-in steps call.
//!
//! These are the only places the engine touches AI models. Hosts implement
//! them over a local microservice, a hosted API or test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::StepError;

/// One detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceDetection {
    /// `[x1, y1, x2, y2]`.
    pub bbox: [i32; 4],
    /// Detector confidence.
    pub confidence: f32,
    /// Estimated age, if the detector provides it.
    #[serde(default)]
    pub age: Option<u32>,
    /// Estimated gender, if the detector provides it.
    #[serde(default)]
    pub gender: Option<String>,
    /// Face embedding vector.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

/// One recognised text region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRegion {
    /// Recognised text.
    pub text: String,
    /// Recogniser confidence.
    pub confidence: f32,
    /// Engine that produced the region.
    #[serde(default)]
    pub source: Option<String>,
}

/// A detected object label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionLabel {
    /// Label name.
    pub label: String,
    /// Detector confidence.
    pub confidence: f32,
}

/// Request to a vision model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisionRequest {
    /// Media to analyse.
    pub media_ref: String,
    /// Caption for context.
    pub caption: Option<String>,
    /// Provider to use.
    pub provider: Option<String>,
    /// Model to use.
    pub model: Option<String>,
}

/// Vision model answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionAnalysis {
    /// Detected labels.
    pub labels: Vec<VisionLabel>,
    /// Free-text description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the content passed the safety check.
    #[serde(default = "default_safe")]
    pub safe: bool,
}

fn default_safe() -> bool {
    true
}

/// Request to a video analyser.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRequest {
    /// Video to analyse.
    pub media_ref: String,
    /// Features to extract, e.g. `labels`, `faces`, `text`, `scenes`.
    pub features: Vec<String>,
    /// Frames sampled per second of video.
    pub sample_fps: f32,
}

/// A label aggregated over the sampled frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoLabel {
    /// Label name.
    pub label: String,
    /// Frames the label was seen in.
    pub count: u32,
    /// Best confidence across those frames.
    pub max_confidence: f32,
}

/// Detections of what is likely one person across frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceGroup {
    /// Seconds into the video of the first detection.
    pub first_seen: f64,
    /// Seconds into the video of the last detection.
    pub last_seen: f64,
    /// Number of detections in the group.
    pub detection_count: u32,
}

/// Video analyser answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAnalysis {
    /// Length in seconds.
    pub duration: f64,
    /// Native frame rate.
    #[serde(default)]
    pub fps: f64,
    /// Frames actually decoded and analysed.
    pub frames_analyzed: u32,
    /// Whether the frames barely change (slideshow or still image).
    #[serde(default)]
    pub static_detected: bool,
    /// Labels aggregated over frames.
    #[serde(default)]
    pub labels: Vec<VideoLabel>,
    /// Face groups.
    #[serde(default)]
    pub face_groups: Vec<FaceGroup>,
    /// Overlay text found in the frames.
    #[serde(default)]
    pub text: Option<String>,
    /// Scene cut timestamps in seconds.
    #[serde(default)]
    pub scene_changes: Vec<f64>,
}

/// Request to a speech transcriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    /// Media whose audio track is transcribed.
    pub media_ref: String,
    /// Transcription model, backend default when unset.
    pub model: Option<String>,
}

/// One timed piece of a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start in seconds.
    pub start: f64,
    /// End in seconds.
    pub end: f64,
    /// Spoken text.
    pub text: String,
}

/// Speech transcriber answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// Full transcript.
    pub text: String,
    /// Timed segments.
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    /// Audio length in seconds.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Detected language code.
    #[serde(default)]
    pub language: Option<String>,
    /// Confidence of the language detection.
    #[serde(default)]
    pub language_probability: Option<f32>,
    /// Overall transcript confidence.
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Model that produced the transcript.
    #[serde(default)]
    pub model: Option<String>,
}

/// Request to a comment generator.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentRequest {
    /// Post caption.
    pub caption: Option<String>,
    /// Post owner username.
    pub owner: Option<String>,
    /// Summaries of the analysis steps.
    pub analysis: serde_json::Value,
    /// Provider to use.
    pub provider: Option<String>,
    /// Model to use.
    pub model: Option<String>,
    /// Number of drafts wanted.
    pub max_comments: usize,
}

/// Face detection backend.
#[async_trait]
pub trait FaceRecognizer: Send + Sync {
    /// Detects faces in the media.
    async fn detect_faces(&self, media_ref: &str) -> Result<Vec<FaceDetection>, StepError>;
}

/// Text recognition backend.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extracts text regions from the media.
    async fn extract_text(&self, media_ref: &str) -> Result<Vec<TextRegion>, StepError>;
}

/// Vision model backend.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Labels and describes the media.
    async fn analyze(&self, request: VisionRequest) -> Result<VisionAnalysis, StepError>;
}

/// Video analysis backend.
#[async_trait]
pub trait VideoAnalyzer: Send + Sync {
    /// Samples frames of the video and aggregates what it finds.
    async fn analyze_video(&self, request: VideoRequest) -> Result<VideoAnalysis, StepError>;
}

/// Speech-to-text backend.
#[async_trait]
pub trait AudioTranscriber: Send + Sync {
    /// Transcribes the media's audio track.
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcription, StepError>;
}

/// Comment drafting backend.
#[async_trait]
pub trait CommentGenerator: Send + Sync {
    /// Drafts comments for a post.
    async fn generate(&self, request: CommentRequest) -> Result<Vec<String>, StepError>;
}

/// The set of backends the built-in steps need.
#[derive(Clone)]
pub struct AnalysisPorts {
    /// Face detection.
    pub faces: Arc<dyn FaceRecognizer>,
    /// Text recognition.
    pub ocr: Arc<dyn OcrEngine>,
    /// Vision model.
    pub vision: Arc<dyn VisionModel>,
    /// Video frame analysis.
    pub video: Arc<dyn VideoAnalyzer>,
    /// Speech transcription.
    pub audio: Arc<dyn AudioTranscriber>,
    /// Comment drafting.
    pub comments: Arc<dyn CommentGenerator>,
}

impl std::fmt::Debug for AnalysisPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPorts").finish_non_exhaustive()
    }
}
