//! # Engageflow
//!
//! An asynchronous multi-step analysis pipeline engine for social media
//! posts and story events.
//!
//! Engageflow runs a set of analysis steps over one subject, each step as
//! its own queued task, with:
//!
//! - **Fan-out/fan-in coordination**: parallel or chained dispatch, a gated
//!   generation phase and exactly-once finalization
//! - **Durable run state**: per-step status kept in the subject's metadata
//!   blob, mutated only under a per-subject lock
//! - **Resource awareness**: a guard that defers work under load instead of
//!   failing it
//! - **Layered retries**: transient backoff, reason-specific waits and a
//!   per-step delivery budget
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engageflow::prelude::*;
//!
//! let engine = Engine::builder(repository, queue)
//!     .ports(ports)
//!     .config(EngineConfig::from_json_file("engageflow.json")?)
//!     .build()?;
//!
//! // Start a run
//! let run_id = engine.start_run("post-42", &RunPlan::standard()).await?;
//!
//! // In the worker, for every delivered task
//! let outcome = engine.handle_task(&task_id, &args).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod coordinator;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod guard;
pub mod kv;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod state;
pub mod steps;
pub mod subject;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, LoggingConfig, StepOverride};
    pub use crate::coordinator::{
        CoordinatorConfig, FanOutCoordinator, PipelineSummary, RunPlan, StepDispatcher,
    };
    pub use crate::core::{PipelineEvent, RunMode, RunStatus, StepStatus};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::errors::{EngageflowError, GuardError, StepError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{ExecutorConfig, SkipReason, StepOutcome, StepRunner};
    pub use crate::guard::{
        AllowAllGuard, GuardConfig, LoadProbe, LoadSnapshot, ProcLoadProbe, ResourceGuard,
        ResourceGuardDecision, ThresholdResourceGuard,
    };
    pub use crate::kv::{InMemoryKeyValueStore, KeyValueStore};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::queue::{EnqueuedTask, InMemoryTaskQueue, StepTaskArgs, TaskQueue};
    pub use crate::retry::{
        BackoffStrategy, FailureClass, JitterStrategy, ReasonWait, ReasonWaitPolicy, RetryConfig,
        RetryPolicy, WaitScope,
    };
    pub use crate::state::{PipelineRun, PipelineStateStore, RunOptions, StepState, WriteOutcome};
    pub use crate::steps::{
        AnalysisPorts, Preflight, StepCapabilities, StepContext, StepHandler, StepKind,
        StepOutput, StepRegistry,
    };
    pub use crate::subject::{
        InMemorySubjectRepository, SaveOutcome, SubjectKind, SubjectRecord, SubjectRepository,
    };
}
