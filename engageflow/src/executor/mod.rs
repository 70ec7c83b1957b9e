//! Generic step execution.
//!
//! [`StepRunner`] applies the same lifecycle to every step: load state,
//! check gates, defer under resource pressure, run under a deadline and
//! record the outcome exactly once.

mod runner;

pub use runner::{SkipReason, StepOutcome, StepRunner};

use serde::{Deserialize, Serialize};

use crate::errors::EngageflowError;

fn default_defer_seconds() -> u64 {
    20
}

fn default_error_max_chars() -> usize {
    crate::state::DEFAULT_ERROR_MAX_CHARS
}

fn default_max_total_attempts() -> u32 {
    24
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Deferral delay when the guard gives no hint.
    #[serde(default = "default_defer_seconds")]
    pub default_defer_seconds: u64,
    /// Maximum stored error length.
    #[serde(default = "default_error_max_chars")]
    pub error_max_chars: usize,
    /// Deliveries allowed per step, counting guard deferrals, readiness
    /// waits and transient retries. Only checked once the guard admits the
    /// delivery.
    #[serde(default = "default_max_total_attempts")]
    pub max_total_attempts: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_defer_seconds: default_defer_seconds(),
            error_max_chars: default_error_max_chars(),
            max_total_attempts: default_max_total_attempts(),
        }
    }
}

impl ExecutorConfig {
    /// Sets the default deferral delay.
    #[must_use]
    pub fn with_default_defer_seconds(mut self, seconds: u64) -> Self {
        self.default_defer_seconds = seconds;
        self
    }

    /// Sets the delivery budget.
    #[must_use]
    pub fn with_max_total_attempts(mut self, attempts: u32) -> Self {
        self.max_total_attempts = attempts;
        self
    }

    /// Validates the settings.
    pub fn validate(&self) -> Result<(), EngageflowError> {
        if self.error_max_chars < 16 {
            return Err(EngageflowError::Config(
                "executor.error_max_chars must be >= 16".into(),
            ));
        }
        if self.max_total_attempts == 0 {
            return Err(EngageflowError::Config(
                "executor.max_total_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}
