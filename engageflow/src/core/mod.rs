//! Core domain types for engageflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Run and step status enums
//! - The structured pipeline event

mod event;
mod status;

pub use event::PipelineEvent;
pub use status::{RunMode, RunStatus, StepStatus};
