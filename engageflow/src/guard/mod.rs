//! Resource guard: admission control for expensive step work.
//!
//! A guard answers "may this task run now?" with an allow/deny decision and a
//! backoff hint. Decisions are advisory and never cached; the executor asks
//! again on every attempt. A guard that errors is treated as allowing the
//! task.

mod probe;
mod threshold;

pub use probe::{LoadProbe, LoadSnapshot, ProcLoadProbe, StaticLoadProbe};
pub use threshold::{GuardConfig, ThresholdResourceGuard};

#[cfg(test)]
pub use probe::MockLoadProbe;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::GuardError;

/// Reason attached to decisions made after the guard itself failed.
pub const GUARD_ERROR_REASON: &str = "guard_error";

/// Outcome of an admission query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGuardDecision {
    /// Whether the task may run now.
    pub allow: bool,
    /// Short machine-readable reason.
    pub reason: String,
    /// Suggested wait before retrying a denied task.
    #[serde(default)]
    pub retry_in_seconds: Option<u64>,
    /// Load observed when deciding.
    #[serde(default)]
    pub snapshot: Option<LoadSnapshot>,
}

impl ResourceGuardDecision {
    /// An unconditional allow.
    #[must_use]
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
            retry_in_seconds: None,
            snapshot: None,
        }
    }

    /// A denial with a backoff hint.
    #[must_use]
    pub fn deny(reason: impl Into<String>, retry_in_seconds: u64) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
            retry_in_seconds: Some(retry_in_seconds),
            snapshot: None,
        }
    }

    /// Attaches the observed load.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: LoadSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}

/// Admission-control gate.
#[async_trait]
pub trait ResourceGuard: Send + Sync {
    /// Decides whether `task_name` on `queue_name` may run now. `critical`
    /// tasks bypass soft throttling but never hard limits.
    async fn allow_task(
        &self,
        task_name: &str,
        queue_name: &str,
        critical: bool,
    ) -> Result<ResourceGuardDecision, GuardError>;

    /// Returns a slot taken by an allowed task.
    async fn release(&self, _task_name: &str) {}
}

/// Queries the guard, failing open on guard errors.
pub async fn check_admission(
    guard: &dyn ResourceGuard,
    task_name: &str,
    queue_name: &str,
    critical: bool,
) -> ResourceGuardDecision {
    match guard.allow_task(task_name, queue_name, critical).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(
                task_name = %task_name,
                queue_name = %queue_name,
                error = %err,
                "Resource guard failed; allowing task"
            );
            ResourceGuardDecision::allow(GUARD_ERROR_REASON)
        }
    }
}

/// Guard that admits everything, for deployments without local inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGuard;

#[async_trait]
impl ResourceGuard for AllowAllGuard {
    async fn allow_task(
        &self,
        _task_name: &str,
        _queue_name: &str,
        _critical: bool,
    ) -> Result<ResourceGuardDecision, GuardError> {
        Ok(ResourceGuardDecision::allow("ok"))
    }
}
