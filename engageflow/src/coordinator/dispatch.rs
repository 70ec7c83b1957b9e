//! Worker-side entry point for step tasks.

use std::sync::Arc;
use tracing::{error, info, warn};

use super::FanOutCoordinator;
use crate::errors::{EngageflowError, StepError};
use crate::executor::{SkipReason, StepOutcome, StepRunner};
use crate::queue::{StepTaskArgs, TaskQueue};
use crate::retry::RetryDecision;
use crate::state::{PipelineStateStore, StepCompletion};
use crate::steps::{RegisteredStep, StepRegistry};

/// Routes a delivered step task through the runner and the coordinator.
pub struct StepDispatcher {
    registry: Arc<StepRegistry>,
    runner: Arc<StepRunner>,
    coordinator: Arc<FanOutCoordinator>,
    queue: Arc<dyn TaskQueue>,
    store: Arc<PipelineStateStore>,
}

impl std::fmt::Debug for StepDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDispatcher")
            .field("runner", &self.runner)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl StepDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        registry: Arc<StepRegistry>,
        runner: Arc<StepRunner>,
        coordinator: Arc<FanOutCoordinator>,
        queue: Arc<dyn TaskQueue>,
        store: Arc<PipelineStateStore>,
    ) -> Self {
        Self {
            registry,
            runner,
            coordinator,
            queue,
            store,
        }
    }

    /// Handles one delivered task.
    ///
    /// Transient step errors are re-enqueued here with backoff, so `Err`
    /// only surfaces infrastructure failures the host queue should retry.
    /// Redelivering the same task is safe: a step that already settled is
    /// not run again, but the run is still moved on from it.
    pub async fn handle(
        &self,
        task_id: &str,
        args: &StepTaskArgs,
    ) -> Result<StepOutcome, EngageflowError> {
        let step = self.registry.resolve(&args.step).map_err(|err| {
            error!(step = %args.step, task_id = %task_id, "Task names an unregistered step");
            err
        })?;

        let outcome = match self.runner.run(step, args, Some(task_id)).await {
            Ok(outcome) => outcome,
            Err(EngageflowError::Step(err)) => self.redeliver(step, args, err).await?,
            Err(other) => return Err(other),
        };

        if outcome.needs_follow_up() {
            self.coordinator.after_step(args, &step.capabilities).await?;
        }
        Ok(outcome)
    }

    async fn redeliver(
        &self,
        step: &RegisteredStep,
        args: &StepTaskArgs,
        err: StepError,
    ) -> Result<StepOutcome, EngageflowError> {
        let reason = err.reason_code().to_string();
        match self.runner.retry_policy().decide(args.retry_attempt, true) {
            RetryDecision::Retry(delay) => {
                let next = args.retried();
                let retry_attempt = next.retry_attempt;
                let task = self
                    .queue
                    .enqueue(&step.capabilities.queue_name, next, Some(delay))
                    .await?;
                self.store
                    .record_step_task(
                        &args.subject_id,
                        &args.run_id,
                        &args.step,
                        &task.queue_name,
                        &task.task_id,
                    )
                    .await?;
                info!(
                    step = %args.step,
                    retry_attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    task_id = %task.task_id,
                    "Step re-enqueued after a transient error"
                );
                Ok(StepOutcome::Retrying {
                    retry_attempt,
                    retry_in: delay,
                    reason,
                })
            }
            RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                warn!(step = %args.step, reason = %reason, "Retry budget spent at redelivery");
                let written = self
                    .store
                    .mark_step_completed(
                        &args.subject_id,
                        &args.run_id,
                        &args.step,
                        StepCompletion::Failed {
                            reason: reason.clone(),
                            error: err.to_string(),
                            result: None,
                        },
                    )
                    .await?;
                if written.is_applied() {
                    Ok(StepOutcome::Failed { reason })
                } else {
                    Ok(StepOutcome::Skipped(SkipReason::StepTerminal))
                }
            }
        }
    }
}
