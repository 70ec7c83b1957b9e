//! Built-in analysis steps.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::handler::{Preflight, StepContext, StepHandler, StepOutput};
use super::kind::StepKind;
use super::ports::{
    AudioTranscriber, CommentGenerator, CommentRequest, FaceDetection, FaceRecognizer, OcrEngine,
    TranscriptionRequest, VideoAnalyzer, VideoRequest, VisionModel, VisionRequest,
};
use crate::errors::{EngageflowError, StepError};
use crate::utils::truncate_chars;

/// Flag enabling comment drafting for a run.
pub const GENERATE_COMMENTS_FLAG: &str = "generate_comments";

const SUMMARY_TEXT_CHARS: usize = 280;

const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "webm", "m4v", "mkv", "avi"];

fn media_ref(ctx: &StepContext) -> Result<&str, StepError> {
    ctx.subject.media_ref.as_deref().ok_or_else(|| {
        StepError::not_ready(
            "media_not_ready",
            format!("subject {} has no media yet", ctx.subject.id),
        )
    })
}

/// Returns true if the media reference points at a video file. Query
/// strings and fragments of URLs are ignored.
#[must_use]
pub fn is_video_media(media_ref: &str) -> bool {
    let path = media_ref.split(['?', '#']).next().unwrap_or(media_ref);
    path.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// Media steps only run on videos. Missing media proceeds so `perform` can
/// wait for it.
fn video_preflight(ctx: &StepContext) -> Preflight {
    match ctx.subject.media_ref.as_deref() {
        Some(media) if !is_video_media(media) => Preflight::skip("not_video"),
        _ => Preflight::Proceed,
    }
}

/// Stable hex fingerprint of a face embedding.
#[must_use]
pub fn embedding_fingerprint(embedding: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for value in embedding {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Face detection and fingerprinting.
pub struct FaceRecognitionStep {
    backend: Arc<dyn FaceRecognizer>,
    min_confidence: f32,
}

impl FaceRecognitionStep {
    /// Creates the step.
    #[must_use]
    pub fn new(backend: Arc<dyn FaceRecognizer>) -> Self {
        Self {
            backend,
            min_confidence: 0.5,
        }
    }

    fn face_json(face: &FaceDetection) -> Value {
        json!({
            "bbox": face.bbox,
            "confidence": face.confidence,
            "age": face.age,
            "gender": face.gender,
            "fingerprint": face.embedding.as_deref().map(embedding_fingerprint),
        })
    }
}

#[async_trait]
impl StepHandler for FaceRecognitionStep {
    fn kind(&self) -> StepKind {
        StepKind::FaceRecognition
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let media = media_ref(ctx)?;
        let faces: Vec<FaceDetection> = self
            .backend
            .detect_faces(media)
            .await?
            .into_iter()
            .filter(|face| face.confidence >= self.min_confidence)
            .collect();

        let max_confidence = faces
            .iter()
            .map(|face| face.confidence)
            .fold(None, |best: Option<f32>, c| Some(best.map_or(c, |b| b.max(c))));

        Ok(StepOutput::new()
            .with("faces", Value::Array(faces.iter().map(Self::face_json).collect()))
            .with("face_count", json!(faces.len()))
            .with("max_confidence", json!(max_confidence)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let fingerprints: Vec<Value> = output
            .get("faces")
            .and_then(Value::as_array)
            .map(|faces| {
                faces
                    .iter()
                    .filter_map(|face| face.get("fingerprint"))
                    .filter(|fp| !fp.is_null())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        json!({
            "face_count": output.get("face_count").cloned().unwrap_or(json!(0)),
            "max_confidence": output.get("max_confidence").cloned().unwrap_or(Value::Null),
            "fingerprints": fingerprints,
        })
    }
}

/// Text extraction.
pub struct OcrStep {
    backend: Arc<dyn OcrEngine>,
    min_confidence: f32,
}

impl OcrStep {
    /// Creates the step.
    #[must_use]
    pub fn new(backend: Arc<dyn OcrEngine>) -> Self {
        Self {
            backend,
            min_confidence: 0.5,
        }
    }
}

#[async_trait]
impl StepHandler for OcrStep {
    fn kind(&self) -> StepKind {
        StepKind::Ocr
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let media = media_ref(ctx)?;
        let regions: Vec<_> = self
            .backend
            .extract_text(media)
            .await?
            .into_iter()
            .filter(|region| region.confidence > self.min_confidence && !region.text.trim().is_empty())
            .collect();

        let text = regions
            .iter()
            .map(|region| region.text.trim())
            .collect::<Vec<_>>()
            .join("\n");
        #[allow(clippy::cast_precision_loss)]
        let mean_confidence = if regions.is_empty() {
            None
        } else {
            Some(regions.iter().map(|r| f64::from(r.confidence)).sum::<f64>() / regions.len() as f64)
        };

        Ok(StepOutput::new()
            .with("has_text", json!(!text.is_empty()))
            .with("text", json!(text))
            .with("regions", json!(regions))
            .with("mean_confidence", json!(mean_confidence)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let text = output.get("text").and_then(Value::as_str).unwrap_or_default();
        json!({
            "has_text": !text.is_empty(),
            "text": truncate_chars(text, SUMMARY_TEXT_CHARS),
            "region_count": output.get("regions").and_then(Value::as_array).map_or(0, Vec::len),
            "mean_confidence": output.get("mean_confidence").cloned().unwrap_or(Value::Null),
        })
    }
}

/// Vision model labelling and description.
pub struct VisualAnalysisStep {
    backend: Arc<dyn VisionModel>,
    max_labels: usize,
}

impl VisualAnalysisStep {
    /// Creates the step.
    #[must_use]
    pub fn new(backend: Arc<dyn VisionModel>) -> Self {
        Self {
            backend,
            max_labels: 20,
        }
    }
}

#[async_trait]
impl StepHandler for VisualAnalysisStep {
    fn kind(&self) -> StepKind {
        StepKind::VisualAnalysis
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let request = VisionRequest {
            media_ref: media_ref(ctx)?.to_string(),
            caption: ctx.subject.caption.clone(),
            provider: ctx.provider().map(str::to_string),
            model: ctx.model().map(str::to_string),
        };
        let mut analysis = self.backend.analyze(request).await?;
        analysis
            .labels
            .sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        analysis.labels.truncate(self.max_labels);

        Ok(StepOutput::new()
            .with("labels", json!(analysis.labels))
            .with("description", json!(analysis.description))
            .with("safe", json!(analysis.safe)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let labels: Vec<Value> = output
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .take(10)
                    .filter_map(|label| label.get("label").cloned())
                    .collect()
            })
            .unwrap_or_default();
        let description = output
            .get("description")
            .and_then(Value::as_str)
            .map(|text| truncate_chars(text, SUMMARY_TEXT_CHARS));

        json!({
            "labels": labels,
            "description": description,
            "safe": output.get("safe").cloned().unwrap_or(json!(true)),
        })
    }
}

/// Frame sampling over a video: labels, face groups, overlay text and
/// scene cuts.
pub struct VideoAnalysisStep {
    backend: Arc<dyn VideoAnalyzer>,
    features: Vec<String>,
    sample_fps: f32,
}

impl VideoAnalysisStep {
    /// Creates the step, sampling one frame per second for every feature.
    #[must_use]
    pub fn new(backend: Arc<dyn VideoAnalyzer>) -> Self {
        Self {
            backend,
            features: ["labels", "faces", "text", "scenes"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            sample_fps: 1.0,
        }
    }

    /// Restricts the extracted features.
    #[must_use]
    pub fn with_features(mut self, features: &[&str]) -> Self {
        self.features = features.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Sets the frame sampling rate.
    #[must_use]
    pub fn with_sample_fps(mut self, sample_fps: f32) -> Self {
        self.sample_fps = sample_fps;
        self
    }
}

#[async_trait]
impl StepHandler for VideoAnalysisStep {
    fn kind(&self) -> StepKind {
        StepKind::VideoAnalysis
    }

    async fn preflight(&self, ctx: &StepContext) -> Preflight {
        video_preflight(ctx)
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let request = VideoRequest {
            media_ref: media_ref(ctx)?.to_string(),
            features: self.features.clone(),
            sample_fps: self.sample_fps,
        };
        let mut analysis = self.backend.analyze_video(request).await?;
        if analysis.frames_analyzed == 0 {
            return Err(StepError::domain(
                "video_analysis_failed",
                format!("no frames of {} could be decoded", ctx.subject.id),
            ));
        }
        analysis.labels.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(b.max_confidence.total_cmp(&a.max_confidence))
        });

        Ok(StepOutput::new()
            .with("duration", json!(analysis.duration))
            .with("fps", json!(analysis.fps))
            .with("frames_analyzed", json!(analysis.frames_analyzed))
            .with("static_detected", json!(analysis.static_detected))
            .with("labels", json!(analysis.labels))
            .with("face_groups", json!(analysis.face_groups))
            .with("text", json!(analysis.text))
            .with("scene_changes", json!(analysis.scene_changes)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let labels: Vec<Value> = output
            .get("labels")
            .and_then(Value::as_array)
            .map(|labels| {
                labels
                    .iter()
                    .take(10)
                    .filter_map(|label| label.get("label").cloned())
                    .collect()
            })
            .unwrap_or_default();
        let count = |key: &str| output.get(key).and_then(Value::as_array).map_or(0, Vec::len);
        let text = output
            .get("text")
            .and_then(Value::as_str)
            .map(|text| truncate_chars(text, SUMMARY_TEXT_CHARS));

        json!({
            "duration": output.get("duration").cloned().unwrap_or(Value::Null),
            "frames_analyzed": output.get("frames_analyzed").cloned().unwrap_or(json!(0)),
            "static_detected": output.get("static_detected").cloned().unwrap_or(json!(false)),
            "labels": labels,
            "face_group_count": count("face_groups"),
            "scene_change_count": count("scene_changes"),
            "text": text,
        })
    }
}

/// Speech transcription of a video's audio track.
pub struct AudioTranscriptionStep {
    backend: Arc<dyn AudioTranscriber>,
    model: Option<String>,
}

impl AudioTranscriptionStep {
    /// Creates the step using the backend's default model.
    #[must_use]
    pub fn new(backend: Arc<dyn AudioTranscriber>) -> Self {
        Self {
            backend,
            model: None,
        }
    }

    /// Pins the transcription model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl StepHandler for AudioTranscriptionStep {
    fn kind(&self) -> StepKind {
        StepKind::AudioTranscription
    }

    async fn preflight(&self, ctx: &StepContext) -> Preflight {
        video_preflight(ctx)
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let request = TranscriptionRequest {
            media_ref: media_ref(ctx)?.to_string(),
            model: self.model.clone(),
        };
        let transcript = self.backend.transcribe(request).await?;
        let text = transcript.text.trim().to_string();

        Ok(StepOutput::new()
            .with("has_speech", json!(!text.is_empty()))
            .with("text", json!(text))
            .with("segments", json!(transcript.segments))
            .with("duration", json!(transcript.duration))
            .with("language", json!(transcript.language))
            .with("language_probability", json!(transcript.language_probability))
            .with("confidence", json!(transcript.confidence))
            .with("model", json!(transcript.model)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let text = output.get("text").and_then(Value::as_str).unwrap_or_default();
        let field = |key: &str| output.get(key).cloned().unwrap_or(Value::Null);
        json!({
            "has_speech": !text.is_empty(),
            "text": truncate_chars(text, SUMMARY_TEXT_CHARS),
            "segment_count": output.get("segments").and_then(Value::as_array).map_or(0, Vec::len),
            "duration": field("duration"),
            "language": field("language"),
            "confidence": field("confidence"),
        })
    }
}

/// Tag derivation from caption text and earlier analysis.
pub struct MetadataTaggingStep {
    hashtag: Regex,
    mention: Regex,
}

impl MetadataTaggingStep {
    /// Creates the step.
    pub fn new() -> Result<Self, EngageflowError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EngageflowError::Config(format!("invalid tag pattern: {e}")))
        };
        Ok(Self {
            hashtag: compile(r"#(\w+)")?,
            mention: compile(r"@([A-Za-z0-9._]+)")?,
        })
    }

    fn captures(pattern: &Regex, text: &str, into: &mut BTreeSet<String>) {
        for capture in pattern.captures_iter(text) {
            if let Some(m) = capture.get(1) {
                into.insert(m.as_str().trim_end_matches('.').to_lowercase());
            }
        }
    }
}

#[async_trait]
impl StepHandler for MetadataTaggingStep {
    fn kind(&self) -> StepKind {
        StepKind::MetadataTagging
    }

    async fn preflight(&self, ctx: &StepContext) -> Preflight {
        let has_caption = ctx.subject.caption.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_analysis = [
            StepKind::VisualAnalysis,
            StepKind::Ocr,
            StepKind::VideoAnalysis,
            StepKind::AudioTranscription,
        ]
        .into_iter()
        .any(|kind| ctx.step_result(kind.key()).is_some());
        if has_caption || has_analysis {
            Preflight::Proceed
        } else {
            Preflight::skip("nothing_to_tag")
        }
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let mut hashtags = BTreeSet::new();
        let mut mentions = BTreeSet::new();
        let mut labels = BTreeSet::new();

        if let Some(caption) = ctx.subject.caption.as_deref() {
            Self::captures(&self.hashtag, caption, &mut hashtags);
            Self::captures(&self.mention, caption, &mut mentions);
        }
        for kind in [StepKind::Ocr, StepKind::VideoAnalysis, StepKind::AudioTranscription] {
            if let Some(text) = ctx
                .step_result(kind.key())
                .and_then(|r| r.get("text"))
                .and_then(Value::as_str)
            {
                Self::captures(&self.hashtag, text, &mut hashtags);
                Self::captures(&self.mention, text, &mut mentions);
            }
        }
        for kind in [StepKind::VisualAnalysis, StepKind::VideoAnalysis] {
            if let Some(found) = ctx
                .step_result(kind.key())
                .and_then(|r| r.get("labels"))
                .and_then(Value::as_array)
            {
                labels.extend(found.iter().filter_map(Value::as_str).map(str::to_lowercase));
            }
        }

        Ok(StepOutput::new()
            .with("hashtags", json!(hashtags))
            .with("mentions", json!(mentions))
            .with("labels", json!(labels)))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        Value::Object(output.data.clone())
    }
}

/// Comment drafting, gated on every analysis step having settled.
pub struct CommentGenerationStep {
    backend: Arc<dyn CommentGenerator>,
    max_comments: usize,
}

impl CommentGenerationStep {
    /// Creates the step.
    #[must_use]
    pub fn new(backend: Arc<dyn CommentGenerator>) -> Self {
        Self {
            backend,
            max_comments: 3,
        }
    }

    fn analysis(ctx: &StepContext) -> Value {
        let mut analysis = serde_json::Map::new();
        for step in ctx.run.analysis_steps() {
            if let Some(result) = ctx.step_result(step) {
                analysis.insert(step.to_string(), result.clone());
            }
        }
        Value::Object(analysis)
    }
}

#[async_trait]
impl StepHandler for CommentGenerationStep {
    fn kind(&self) -> StepKind {
        StepKind::CommentGeneration
    }

    async fn preflight(&self, ctx: &StepContext) -> Preflight {
        if ctx.run.flag_enabled(GENERATE_COMMENTS_FLAG) {
            Preflight::Proceed
        } else {
            Preflight::skip("comments_disabled")
        }
    }

    async fn perform(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        if ctx.subject.owner.is_none() {
            return Err(StepError::not_ready(
                "profile_data_incomplete",
                format!("owner profile of {} not scraped yet", ctx.subject.id),
            ));
        }

        let analysis = Self::analysis(ctx);
        let has_caption = ctx.subject.caption.as_deref().is_some_and(|c| !c.trim().is_empty());
        if !has_caption && analysis.as_object().is_some_and(serde_json::Map::is_empty) {
            return Err(StepError::domain(
                "insufficient_context",
                "no caption and no successful analysis to comment on",
            ));
        }

        let request = CommentRequest {
            caption: ctx.subject.caption.clone(),
            owner: ctx.subject.owner.clone(),
            analysis,
            provider: ctx.provider().map(str::to_string),
            model: ctx.model().map(str::to_string),
            max_comments: self.max_comments,
        };
        let mut seen = BTreeSet::new();
        let comments: Vec<String> = self
            .backend
            .generate(request)
            .await?
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .take(self.max_comments)
            .collect();

        if comments.is_empty() {
            return Err(StepError::domain(
                "comment_generation_empty",
                "generator returned no usable comments",
            ));
        }

        Ok(StepOutput::new()
            .with("comments", json!(comments))
            .with("provider", json!(ctx.provider()))
            .with("model", json!(ctx.model())))
    }

    fn completion_result(&self, output: &StepOutput) -> Value {
        let comments = output.get("comments").cloned().unwrap_or_else(|| json!([]));
        json!({
            "comment_count": comments.as_array().map_or(0, Vec::len),
            "comments": comments,
            "provider": output.get("provider").cloned().unwrap_or(Value::Null),
            "model": output.get("model").cloned().unwrap_or(Value::Null),
        })
    }
}
