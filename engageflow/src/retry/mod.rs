//! Failure classification and retry policy.
//!
//! Transient infrastructure errors are retried by re-enqueueing the task with
//! a backoff delay. "Not ready yet" conditions wait per reason code. Resource
//! exhaustion is handled by the executor's deferral loop, and everything else
//! is a terminal domain failure.

mod backoff;
mod reason;

pub use backoff::{should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision};
pub use reason::{ReasonWait, ReasonWaitOutcome, ReasonWaitPolicy, WaitScope};

use serde::{Deserialize, Serialize};

use crate::errors::StepError;
use crate::kv::KeyValueStore;

/// How a step failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry at the queue level with backoff.
    Transient,
    /// Defer, then fail with `resource_constraints`.
    ResourceExhausted,
    /// Wait per reason code, then fail.
    NotReady,
    /// Terminal failure with a reason code.
    Domain,
}

/// Classifies a step error.
#[must_use]
pub fn classify(error: &StepError) -> FailureClass {
    match error {
        StepError::Transient { .. } => FailureClass::Transient,
        StepError::ResourceConstraints { .. } => FailureClass::ResourceExhausted,
        StepError::NotReady { .. } => FailureClass::NotReady,
        StepError::Timeout { .. }
        | StepError::Domain { .. }
        | StepError::Backend { .. }
        | StepError::Internal(_) => FailureClass::Domain,
    }
}

/// Combined transient and reason-code retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff for transient failures.
    #[serde(default)]
    pub transient: RetryConfig,
    /// Waits for "not ready yet" reasons.
    #[serde(default)]
    pub reasons: ReasonWaitPolicy,
}

impl RetryPolicy {
    /// Sets the transient backoff.
    #[must_use]
    pub fn with_transient(mut self, config: RetryConfig) -> Self {
        self.transient = config;
        self
    }

    /// Sets the reason waits.
    #[must_use]
    pub fn with_reasons(mut self, reasons: ReasonWaitPolicy) -> Self {
        self.reasons = reasons;
        self
    }

    /// Returns true if a task on its `retry_attempt`-th redelivery may be
    /// retried once more.
    #[must_use]
    pub fn transient_budget_left(&self, retry_attempt: u32) -> bool {
        self.transient.has_budget(retry_attempt)
    }

    /// Decides on a task-level retry.
    #[must_use]
    pub fn decide(&self, retry_attempt: u32, retryable: bool) -> RetryDecision {
        should_retry(&self.transient, retry_attempt, retryable)
    }

    /// Takes a wait for a "not ready" reason from the step's budget.
    pub async fn reason_wait(
        &self,
        kv: &dyn KeyValueStore,
        scope: WaitScope<'_>,
        reason: &str,
    ) -> ReasonWaitOutcome {
        self.reasons.next_wait(kv, scope, reason).await
    }
}
