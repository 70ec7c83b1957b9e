//! Analysis step catalogue.
//!
//! Steps are a closed set ([`StepKind`]). Each kind has a [`StepHandler`]
//! doing the work and a [`StepCapabilities`] record telling the executor how
//! to gate, time and finalize it. The [`StepRegistry`] ties them together.

mod builtin;
mod capabilities;
mod handler;
mod kind;
mod ports;
mod registry;

pub use builtin::{
    embedding_fingerprint, is_video_media, AudioTranscriptionStep, CommentGenerationStep,
    FaceRecognitionStep, MetadataTaggingStep, OcrStep, VideoAnalysisStep, VisualAnalysisStep,
    GENERATE_COMMENTS_FLAG,
};
pub use capabilities::StepCapabilities;
pub use handler::{Preflight, StepContext, StepHandler, StepOutput};
pub use kind::StepKind;
pub use ports::{
    AnalysisPorts, AudioTranscriber, CommentGenerator, CommentRequest, FaceDetection, FaceGroup,
    FaceRecognizer, OcrEngine, TextRegion, TranscriptSegment, Transcription, TranscriptionRequest,
    VideoAnalysis, VideoAnalyzer, VideoLabel, VideoRequest, VisionAnalysis, VisionLabel,
    VisionModel, VisionRequest,
};
pub use registry::{RegisteredStep, StepRegistry};
