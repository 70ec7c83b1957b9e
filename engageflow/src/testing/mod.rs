//! Testing utilities for engageflow hosts and steps.
//!
//! This module provides:
//! - Scripted step handlers, analysis backends and resource guards
//! - An in-process engine harness that drains its own queue
//! - Assertions over persisted run state

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_run_status, assert_step_failed_with, assert_step_result, assert_step_status,
};
pub use fixtures::{fixture_post, Delivery, TestEngine};
pub use mocks::{ScriptedBackend, ScriptedGuard, ScriptedStep};
