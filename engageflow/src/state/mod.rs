//! Persisted per-subject pipeline state.
//!
//! Pipeline runs live inside the subject's metadata blob under
//! [`PIPELINE_METADATA_KEY`]. All mutations go through
//! [`PipelineStateStore`], which serializes writers per subject.

mod locks;
mod model;
mod store;

pub use locks::{SubjectLockGuard, SubjectLocks};
pub use model::{
    GenerationMarker, PipelineMetadata, PipelineRun, RunOptions, StepState,
    PIPELINE_METADATA_KEY,
};
pub use store::{
    PipelineStateStore, StepCompletion, WriteOutcome, DEFAULT_ERROR_MAX_CHARS,
    DEFAULT_HISTORY_LIMIT,
};
