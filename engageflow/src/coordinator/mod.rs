//! Run orchestration.
//!
//! A run fans out into one task per analysis step. Each settled step fans
//! back in through [`FanOutCoordinator::after_step`], which continues
//! chained runs, opens the generation phase and finalizes the run exactly
//! once. [`StepDispatcher`] is what a worker calls for every delivered task.

mod dispatch;
mod fanout;
mod plan;
mod summary;

#[cfg(test)]
mod integration_tests;

pub use dispatch::StepDispatcher;
pub use fanout::FanOutCoordinator;
pub use plan::RunPlan;
pub use summary::{PipelineSummary, StepSummary};

use serde::{Deserialize, Serialize};

use crate::errors::EngageflowError;

fn default_history_limit() -> usize {
    crate::state::DEFAULT_HISTORY_LIMIT
}

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Delay added between successive analysis steps of a parallel run.
    #[serde(default)]
    pub stagger_seconds: u64,
    /// Runs kept per subject.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stagger_seconds: 0,
            history_limit: default_history_limit(),
        }
    }
}

impl CoordinatorConfig {
    /// Sets the stagger interval.
    #[must_use]
    pub fn with_stagger_seconds(mut self, seconds: u64) -> Self {
        self.stagger_seconds = seconds;
        self
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), EngageflowError> {
        if self.history_limit == 0 {
            return Err(EngageflowError::Config(
                "coordinator.history_limit must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
