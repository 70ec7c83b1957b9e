//! Engine configuration.
//!
//! Every section has serde defaults, so an empty JSON object is a valid
//! configuration. Load with [`EngineConfig::from_json_file`] or build in code
//! and call [`EngineConfig::validate`] before use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::errors::EngageflowError;
use crate::executor::ExecutorConfig;
use crate::guard::GuardConfig;
use crate::observability::LogFormat;
use crate::retry::RetryPolicy;
use crate::steps::{StepCapabilities, StepKind};

fn default_log_filter() -> String {
    "engageflow=info".to_string()
}

/// Logging bootstrap settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Per-step capability overrides. Unset fields keep the step's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOverride {
    /// Queue the step's tasks go to.
    #[serde(default)]
    pub queue_name: Option<String>,
    /// Deadline in seconds; `0` removes the deadline.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Resource-guard deferrals before giving up.
    #[serde(default)]
    pub max_defer_attempts: Option<u32>,
    /// Delivery budget.
    #[serde(default)]
    pub max_total_attempts: Option<u32>,
    /// Whether completion attempts finalization.
    #[serde(default)]
    pub triggers_finalize: Option<bool>,
    /// Whether the step bypasses soft throttling.
    #[serde(default)]
    pub critical: Option<bool>,
}

impl StepOverride {
    /// Applies the override on top of existing capabilities.
    #[must_use]
    pub fn apply(&self, mut caps: StepCapabilities) -> StepCapabilities {
        if let Some(queue) = &self.queue_name {
            caps = caps.with_queue(queue.clone());
        }
        if let Some(seconds) = self.timeout_seconds {
            caps = caps.with_timeout((seconds > 0).then(|| Duration::from_secs(seconds)));
        }
        if let Some(attempts) = self.max_defer_attempts {
            caps = caps.with_max_defer_attempts(attempts);
        }
        if let Some(attempts) = self.max_total_attempts {
            caps = caps.with_max_total_attempts(attempts);
        }
        if let Some(triggers) = self.triggers_finalize {
            caps = caps.with_triggers_finalize(triggers);
        }
        if let Some(critical) = self.critical {
            caps = caps.with_critical(critical);
        }
        caps
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Step execution settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Transient retries and reason waits.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Resource guard thresholds.
    #[serde(default)]
    pub guard: GuardConfig,
    /// Dispatch and history settings.
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Capability overrides keyed by step.
    #[serde(default)]
    pub steps: BTreeMap<StepKind, StepOverride>,
    /// Logging bootstrap.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Parses a JSON configuration and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, EngageflowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngageflowError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file and validates it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngageflowError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Sets a step override.
    #[must_use]
    pub fn with_step(mut self, kind: StepKind, step: StepOverride) -> Self {
        self.steps.insert(kind, step);
        self
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), EngageflowError> {
        self.executor.validate()?;
        self.guard.validate()?;
        self.coordinator.validate()?;

        let transient = &self.retry.transient;
        if transient.max_attempts == 0 {
            return Err(EngageflowError::Config(
                "retry.transient.max_attempts must be >= 1".into(),
            ));
        }
        if transient.base_delay_ms > transient.max_delay_ms {
            return Err(EngageflowError::Config(format!(
                "retry.transient.base_delay_ms ({}) exceeds max_delay_ms ({})",
                transient.base_delay_ms, transient.max_delay_ms
            )));
        }

        for (kind, step) in &self.steps {
            if step.queue_name.as_deref().is_some_and(str::is_empty) {
                return Err(EngageflowError::Config(format!(
                    "steps.{kind}.queue_name must not be empty"
                )));
            }
            if step.max_total_attempts == Some(0) {
                return Err(EngageflowError::Config(format!(
                    "steps.{kind}.max_total_attempts must be >= 1"
                )));
            }
        }

        if self.logging.filter.trim().is_empty() {
            return Err(EngageflowError::Config("logging.filter must not be empty".into()));
        }
        Ok(())
    }
}
