//! Scripted doubles for steps, backends and the resource guard.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{GuardError, StepError};
use crate::guard::{ResourceGuard, ResourceGuardDecision};
use crate::steps::{
    AnalysisPorts, AudioTranscriber, CommentGenerator, CommentRequest, FaceDetection,
    FaceRecognizer, OcrEngine, Preflight, StepContext, StepHandler, StepKind, StepOutput,
    TextRegion, Transcription, TranscriptionRequest, VideoAnalysis, VideoAnalyzer, VideoRequest,
    VisionAnalysis, VisionModel, VisionRequest,
};

/// A step handler that replays scripted results.
///
/// Once the script runs dry every call succeeds with an empty output.
#[derive(Debug)]
pub struct ScriptedStep {
    kind: StepKind,
    script: Mutex<VecDeque<Result<StepOutput, StepError>>>,
    calls: Arc<AtomicUsize>,
    delay: Option<Duration>,
    preflight: Preflight,
}

impl ScriptedStep {
    /// Creates a step that always succeeds.
    #[must_use]
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: None,
            preflight: Preflight::Proceed,
        }
    }

    /// Queues the result of the next call.
    pub fn push(&self, result: Result<StepOutput, StepError>) {
        self.script.lock().push_back(result);
    }

    /// Sleeps before answering each call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the preflight answer.
    #[must_use]
    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = preflight;
        self
    }

    /// Shared counter of `perform` calls, usable after the step moved into
    /// a registry.
    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    /// Number of `perform` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    fn kind(&self) -> StepKind {
        self.kind
    }

    async fn preflight(&self, _ctx: &StepContext) -> Preflight {
        self.preflight.clone()
    }

    async fn perform(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(StepOutput::new()))
    }
}

/// A resource guard replaying scripted decisions, allowing by default.
#[derive(Debug, Default)]
pub struct ScriptedGuard {
    script: Mutex<VecDeque<Result<ResourceGuardDecision, GuardError>>>,
    queries: AtomicUsize,
    released: AtomicUsize,
}

impl ScriptedGuard {
    /// Creates a guard that allows everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next decision.
    pub fn push(&self, decision: Result<ResourceGuardDecision, GuardError>) {
        self.script.lock().push_back(decision);
    }

    /// Number of admission queries.
    #[must_use]
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of released slots.
    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceGuard for ScriptedGuard {
    async fn allow_task(
        &self,
        _task_name: &str,
        _queue_name: &str,
        _critical: bool,
    ) -> Result<ResourceGuardDecision, GuardError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ResourceGuardDecision::allow("ok")))
    }

    async fn release(&self, _task_name: &str) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct BackendScript {
    faces: Mutex<VecDeque<Result<Vec<FaceDetection>, StepError>>>,
    text: Mutex<VecDeque<Result<Vec<TextRegion>, StepError>>>,
    vision: Mutex<VecDeque<Result<VisionAnalysis, StepError>>>,
    video: Mutex<VecDeque<Result<VideoAnalysis, StepError>>>,
    transcripts: Mutex<VecDeque<Result<Transcription, StepError>>>,
    transcription_requests: Mutex<Vec<TranscriptionRequest>>,
    comments: Mutex<VecDeque<Result<Vec<String>, StepError>>>,
    comment_requests: Mutex<Vec<CommentRequest>>,
}

/// Every analysis backend at once, replaying scripted answers.
///
/// Clones share one script. Unscripted calls return no faces, no text, an
/// empty safe analysis, a one-frame video without findings, a silent
/// transcript and a single comment.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    script: Arc<BackendScript>,
}

impl ScriptedBackend {
    /// Creates a backend with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires this backend into every port.
    #[must_use]
    pub fn ports(&self) -> AnalysisPorts {
        AnalysisPorts {
            faces: Arc::new(self.clone()),
            ocr: Arc::new(self.clone()),
            vision: Arc::new(self.clone()),
            video: Arc::new(self.clone()),
            audio: Arc::new(self.clone()),
            comments: Arc::new(self.clone()),
        }
    }

    /// Queues a face detection answer.
    pub fn push_faces(&self, result: Result<Vec<FaceDetection>, StepError>) {
        self.script.faces.lock().push_back(result);
    }

    /// Queues an OCR answer.
    pub fn push_text(&self, result: Result<Vec<TextRegion>, StepError>) {
        self.script.text.lock().push_back(result);
    }

    /// Queues a vision answer.
    pub fn push_vision(&self, result: Result<VisionAnalysis, StepError>) {
        self.script.vision.lock().push_back(result);
    }

    /// Queues a video analysis answer.
    pub fn push_video(&self, result: Result<VideoAnalysis, StepError>) {
        self.script.video.lock().push_back(result);
    }

    /// Queues a transcription answer.
    pub fn push_transcription(&self, result: Result<Transcription, StepError>) {
        self.script.transcripts.lock().push_back(result);
    }

    /// Transcription requests received so far.
    #[must_use]
    pub fn transcription_requests(&self) -> Vec<TranscriptionRequest> {
        self.script.transcription_requests.lock().clone()
    }

    /// Queues a comment drafting answer.
    pub fn push_comments(&self, result: Result<Vec<String>, StepError>) {
        self.script.comments.lock().push_back(result);
    }

    /// Comment requests received so far.
    #[must_use]
    pub fn comment_requests(&self) -> Vec<CommentRequest> {
        self.script.comment_requests.lock().clone()
    }
}

#[async_trait]
impl FaceRecognizer for ScriptedBackend {
    async fn detect_faces(&self, _media_ref: &str) -> Result<Vec<FaceDetection>, StepError> {
        self.script.faces.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl OcrEngine for ScriptedBackend {
    async fn extract_text(&self, _media_ref: &str) -> Result<Vec<TextRegion>, StepError> {
        self.script.text.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl VisionModel for ScriptedBackend {
    async fn analyze(&self, _request: VisionRequest) -> Result<VisionAnalysis, StepError> {
        self.script.vision.lock().pop_front().unwrap_or_else(|| {
            Ok(VisionAnalysis {
                labels: Vec::new(),
                description: None,
                safe: true,
            })
        })
    }
}

#[async_trait]
impl VideoAnalyzer for ScriptedBackend {
    async fn analyze_video(&self, _request: VideoRequest) -> Result<VideoAnalysis, StepError> {
        self.script.video.lock().pop_front().unwrap_or_else(|| {
            Ok(VideoAnalysis {
                duration: 1.0,
                fps: 30.0,
                frames_analyzed: 1,
                static_detected: true,
                labels: Vec::new(),
                face_groups: Vec::new(),
                text: None,
                scene_changes: Vec::new(),
            })
        })
    }
}

#[async_trait]
impl AudioTranscriber for ScriptedBackend {
    async fn transcribe(&self, request: TranscriptionRequest) -> Result<Transcription, StepError> {
        self.script.transcription_requests.lock().push(request);
        self.script.transcripts.lock().pop_front().unwrap_or_else(|| {
            Ok(Transcription {
                text: String::new(),
                segments: Vec::new(),
                duration: None,
                language: None,
                language_probability: None,
                confidence: None,
                model: None,
            })
        })
    }
}

#[async_trait]
impl CommentGenerator for ScriptedBackend {
    async fn generate(&self, request: CommentRequest) -> Result<Vec<String>, StepError> {
        self.script.comment_requests.lock().push(request);
        self.script
            .comments
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(vec!["Nice post!".to_string()]))
    }
}
