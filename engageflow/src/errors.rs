//! Error types for the engageflow engine.
//!
//! Two layers are distinguished: [`EngageflowError`] covers infrastructure
//! and wiring problems surfaced to the caller, while [`StepError`] is what an
//! individual analysis step raises while doing its work. Every `StepError`
//! carries a stable reason code that ends up in the persisted step state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngageflowError {
    /// The subject repository failed to load or persist state.
    #[error("State store error: {0}")]
    Store(String),

    /// The task queue refused or failed an enqueue.
    #[error("Task queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration or run plan.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A task referenced a step that is not registered.
    #[error("Unknown step: {0}")]
    UnknownStep(String),

    /// A step error the task-level retry wrapper should see.
    #[error("{0}")]
    Step(#[from] StepError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for EngageflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl EngageflowError {
    /// Returns the wrapped step error, if any.
    #[must_use]
    pub fn as_step_error(&self) -> Option<&StepError> {
        match self {
            Self::Step(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors raised while executing a single pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Network timeout, connection reset and similar infrastructure hiccups.
    #[error("Transient failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The step exceeded its hard execution deadline.
    #[error("Step timed out after {seconds}s")]
    Timeout {
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// The resource guard kept denying admission.
    #[error("Resource constraints: {message}")]
    ResourceConstraints {
        /// Description of the denial.
        message: String,
    },

    /// The work ran but produced an unusable result.
    #[error("{reason}: {message}")]
    Domain {
        /// Step-specific reason code (e.g. `face_analysis_failed`).
        reason: String,
        /// Description of the failure.
        message: String,
    },

    /// A dependency of the work is not available yet; retry much later.
    #[error("Not ready ({reason}): {message}")]
    NotReady {
        /// Reason code selecting the wait window.
        reason: String,
        /// Description of what is missing.
        message: String,
    },

    /// The inference backend reported an error.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StepError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a domain error with a reason code.
    #[must_use]
    pub fn domain(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Domain {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Creates a not-ready error with a reason code.
    #[must_use]
    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotReady {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Creates a backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Returns the reason code persisted with a failed step.
    #[must_use]
    pub fn reason_code(&self) -> &str {
        match self {
            Self::Transient { .. } => "transient_failure",
            Self::Timeout { .. } => "timeout",
            Self::ResourceConstraints { .. } => "resource_constraints",
            Self::Domain { reason, .. } | Self::NotReady { reason, .. } => reason,
            Self::Backend { .. } => "backend_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns true if the error is an infrastructure hiccup worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("reason".to_string(), serde_json::json!(self.reason_code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map.insert("transient".to_string(), serde_json::json!(self.is_transient()));
        map
    }
}

/// Errors reported by a resource guard implementation.
///
/// Callers never propagate these: a broken guard fails open.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("Resource guard error: {0}")]
pub struct GuardError(pub String);
