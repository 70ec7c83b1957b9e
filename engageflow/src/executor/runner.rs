//! The step runner.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use super::ExecutorConfig;
use crate::core::PipelineEvent;
use crate::errors::{EngageflowError, StepError};
use crate::events::EventSink;
use crate::guard::{check_admission, ResourceGuard, GUARD_ERROR_REASON};
use crate::kv::KeyValueStore;
use crate::observability::{step_span, SpanTimer};
use crate::queue::{StepTaskArgs, TaskQueue};
use crate::retry::{ReasonWaitOutcome, RetryPolicy, WaitScope};
use crate::state::{PipelineStateStore, StepCompletion, WriteOutcome};
use crate::steps::{Preflight, RegisteredStep, StepContext};
use crate::utils::{now_utc, truncate_chars};

/// Why a delivery did nothing, or only recorded a skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The subject or run no longer exists.
    StaleContext,
    /// The run was already finalized.
    PipelineTerminal,
    /// The step already reached a terminal state.
    StepTerminal,
    /// Preflight declined the delivery; nothing was recorded.
    Preflight(String),
}

/// What a delivery of a step task did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Nothing ran.
    Skipped(SkipReason),
    /// The step was re-enqueued for later, either because the resource
    /// guard denied admission or because a dependency is not ready yet.
    Deferred {
        /// Guard deferrals, or readiness waits, recorded on the step so far,
        /// including this one.
        attempts: u32,
        /// Delay until the next delivery.
        retry_in: Duration,
        /// Why the step was deferred.
        reason: String,
    },
    /// A transient error handed the step back for a later redelivery.
    Retrying {
        /// Redelivery number of the next task.
        retry_attempt: u32,
        /// Delay until the redelivery.
        retry_in: Duration,
        /// Reason code of the error.
        reason: String,
    },
    /// The step succeeded.
    Succeeded {
        /// Persisted result summary.
        result: Value,
    },
    /// The step failed permanently.
    Failed {
        /// Reason code.
        reason: String,
    },
}

impl StepOutcome {
    /// Returns true if this delivery moved the step to a terminal state.
    #[must_use]
    pub fn settled_step(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. }
        )
    }

    /// Returns true if the coordinator should look at the run after this
    /// delivery. Duplicate deliveries of a settled step or a finalized run
    /// count, since the delivery that settled it may have died before moving
    /// the run on.
    #[must_use]
    pub fn needs_follow_up(&self) -> bool {
        self.settled_step()
            || matches!(
                self,
                Self::Skipped(SkipReason::StepTerminal | SkipReason::PipelineTerminal)
            )
    }

    fn from_write(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Missing => Self::Skipped(SkipReason::StaleContext),
            WriteOutcome::Applied | WriteOutcome::Unchanged => {
                Self::Skipped(SkipReason::StepTerminal)
            }
        }
    }
}

/// Which counter a re-enqueue is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// The resource guard denied admission.
    Deferral,
    /// A dependency of the work is not ready yet.
    Wait,
}

impl Hold {
    fn as_str(self) -> &'static str {
        match self {
            Self::Deferral => "deferral",
            Self::Wait => "wait",
        }
    }
}

/// Runs one delivery of one step task.
pub struct StepRunner {
    store: Arc<PipelineStateStore>,
    guard: Arc<dyn ResourceGuard>,
    queue: Arc<dyn TaskQueue>,
    kv: Arc<dyn KeyValueStore>,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
    config: ExecutorConfig,
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("retry", &self.retry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StepRunner {
    /// Creates a runner with default retry and executor settings.
    #[must_use]
    pub fn new(
        store: Arc<PipelineStateStore>,
        guard: Arc<dyn ResourceGuard>,
        queue: Arc<dyn TaskQueue>,
        kv: Arc<dyn KeyValueStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            guard,
            queue,
            kv,
            events,
            retry: RetryPolicy::default(),
            config: ExecutorConfig::default(),
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// The retry policy in use.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Runs one delivery.
    ///
    /// Returns `Err` only when the task should be redelivered: a retryable
    /// step error with budget left, or an infrastructure failure. The step
    /// state has already been updated by then.
    pub async fn run(
        &self,
        step: &RegisteredStep,
        args: &StepTaskArgs,
        task_id: Option<&str>,
    ) -> Result<StepOutcome, EngageflowError> {
        let span = step_span(&args.subject_id, &args.run_id, &args.step);
        self.execute(step, args, task_id).instrument(span).await
    }

    async fn execute(
        &self,
        step: &RegisteredStep,
        args: &StepTaskArgs,
        task_id: Option<&str>,
    ) -> Result<StepOutcome, EngageflowError> {
        let name = step.capabilities.kind.key();
        let caps = &step.capabilities;

        let Some((subject, run)) = self.store.load_context(&args.subject_id, &args.run_id).await?
        else {
            debug!("Run no longer exists; dropping task");
            return Ok(StepOutcome::Skipped(SkipReason::StaleContext));
        };
        let Some(state) = run.step(name) else {
            debug!("Run does not declare this step; dropping task");
            return Ok(StepOutcome::Skipped(SkipReason::StaleContext));
        };
        if run.is_terminal() && !run.is_deferred_step(name) {
            debug!(status = %run.status, "Run already finalized; dropping task");
            return Ok(StepOutcome::Skipped(SkipReason::PipelineTerminal));
        }
        if state.is_terminal() {
            debug!(status = %state.status, "Duplicate delivery for a settled step");
            return Ok(StepOutcome::Skipped(SkipReason::StepTerminal));
        }
        let attempts = state.attempts;
        let reason_waits = state.reason_waits;

        let ctx = StepContext {
            subject,
            run,
            args: args.clone(),
        };

        match step.handler.preflight(&ctx).await {
            Preflight::Proceed => {}
            Preflight::Abort { reason } => {
                debug!(reason = %reason, "Preflight dropped the delivery");
                return Ok(StepOutcome::Skipped(SkipReason::Preflight(reason)));
            }
            Preflight::Skip { reason } => return self.skip(args, name, reason).await,
            Preflight::Fail { reason, message } => {
                return self.fail(args, name, &reason, message).await;
            }
        }

        let decision = check_admission(
            self.guard.as_ref(),
            &caps.resource_task_name,
            &caps.queue_name,
            caps.critical,
        )
        .await;

        if !decision.allow {
            if attempts < caps.max_defer_attempts {
                let delay = Duration::from_secs(
                    decision
                        .retry_in_seconds
                        .unwrap_or(self.config.default_defer_seconds),
                );
                let result = json!({
                    "deferred_reason": decision.reason,
                    "snapshot": decision.snapshot,
                });
                return self
                    .defer(
                        args,
                        step,
                        args.deferred(),
                        delay,
                        (Hold::Deferral, attempts),
                        &decision.reason,
                        result,
                    )
                    .await;
            }
            return self
                .fail(
                    args,
                    name,
                    "resource_constraints",
                    format!(
                        "resource guard denied admission after {attempts} deferrals ({})",
                        decision.reason
                    ),
                )
                .await;
        }

        let holds_slot = decision.reason != GUARD_ERROR_REASON;

        // Checked only once admitted, so guard exhaustion always reports
        // resource_constraints.
        let budget = caps.max_total_attempts.unwrap_or(self.config.max_total_attempts);
        let used = attempts
            .saturating_add(reason_waits)
            .saturating_add(args.retry_attempt);
        if used >= budget {
            if holds_slot {
                self.guard.release(&caps.resource_task_name).await;
            }
            return self
                .fail(
                    args,
                    name,
                    "attempt_budget_exhausted",
                    format!(
                        "{attempts} deferrals, {reason_waits} waits and {} retries used the budget of {budget} deliveries",
                        args.retry_attempt
                    ),
                )
                .await;
        }

        let outcome = self.perform(step, &ctx, task_id, reason_waits).await;
        if holds_slot {
            self.guard.release(&caps.resource_task_name).await;
        }
        outcome
    }

    async fn perform(
        &self,
        step: &RegisteredStep,
        ctx: &StepContext,
        task_id: Option<&str>,
        reason_waits: u32,
    ) -> Result<StepOutcome, EngageflowError> {
        let args = &ctx.args;
        let caps = &step.capabilities;
        let name = caps.kind.key();

        let marked = self
            .store
            .mark_step_running(&args.subject_id, &args.run_id, name, &caps.queue_name, task_id)
            .await?;
        if !marked.is_applied() {
            debug!(outcome = ?marked, "Step settled before it could start");
            return Ok(StepOutcome::from_write(marked));
        }
        self.emit(args, PipelineEvent::step("running", name, 10)).await;

        let timer = SpanTimer::start(name);
        let result = match caps.timeout {
            Some(limit) => tokio::time::timeout(limit, step.handler.perform(ctx))
                .await
                .unwrap_or(Err(StepError::Timeout {
                    seconds: limit.as_secs(),
                })),
            None => step.handler.perform(ctx).await,
        };
        let duration_ms = timer.finish();

        match result {
            Ok(output) => {
                let summary = step.handler.completion_result(&output);
                let written = self
                    .store
                    .mark_step_completed(
                        &args.subject_id,
                        &args.run_id,
                        name,
                        StepCompletion::Succeeded {
                            result: summary.clone(),
                        },
                    )
                    .await?;
                if !written.is_applied() {
                    return Ok(StepOutcome::from_write(written));
                }
                if let Some(reason) = Self::waiting_for(ctx, name) {
                    self.retry
                        .reasons
                        .reset(self.kv.as_ref(), Self::wait_scope(args, name), reason)
                        .await;
                }
                info!(duration_ms, "Step succeeded");
                self.emit(
                    args,
                    PipelineEvent::step("succeeded", name, 100)
                        .add_detail("duration_ms", json!(duration_ms))
                        .add_detail("result", summary.clone()),
                )
                .await;
                Ok(StepOutcome::Succeeded { result: summary })
            }
            Err(err) => self.handle_error(step, args, err, reason_waits).await,
        }
    }

    fn wait_scope<'a>(args: &'a StepTaskArgs, name: &'a str) -> WaitScope<'a> {
        WaitScope::new(&args.subject_id, &args.run_id, name)
    }

    /// Reason the step last waited for, if its previous delivery was a
    /// reason wait.
    fn waiting_for<'a>(ctx: &'a StepContext, name: &str) -> Option<&'a str> {
        ctx.run
            .step(name)
            .and_then(|state| state.result.as_ref())
            .and_then(|result| result.get("waiting_for"))
            .and_then(Value::as_str)
    }

    async fn handle_error(
        &self,
        step: &RegisteredStep,
        args: &StepTaskArgs,
        err: StepError,
        reason_waits: u32,
    ) -> Result<StepOutcome, EngageflowError> {
        let name = step.capabilities.kind.key();

        if let StepError::NotReady { reason, .. } = &err {
            return match self
                .retry
                .reason_wait(self.kv.as_ref(), Self::wait_scope(args, name), reason)
                .await
            {
                ReasonWaitOutcome::Wait { delay, attempt } => {
                    let result = json!({ "waiting_for": reason, "wait": attempt });
                    self.defer(
                        args,
                        step,
                        args.clone(),
                        delay,
                        (Hold::Wait, reason_waits),
                        reason,
                        result,
                    )
                    .await
                }
                ReasonWaitOutcome::Exhausted { .. } => {
                    self.fail(args, name, reason, err.to_string()).await
                }
            };
        }

        if step.handler.is_retryable(&err) && self.retry.transient_budget_left(args.retry_attempt) {
            let message = err.to_string();
            let written = self
                .store
                .mark_step_awaiting_retry(&args.subject_id, &args.run_id, name, &message)
                .await?;
            if !written.is_applied() {
                return Ok(StepOutcome::from_write(written));
            }
            warn!(
                error = %message,
                retry_attempt = args.retry_attempt,
                "Step hit a retryable error; handing back for redelivery"
            );
            self.emit(
                args,
                PipelineEvent::step("queued", name, 0)
                    .add_detail("retry_attempt", json!(args.retry_attempt + 1))
                    .add_detail("error", json!(self.truncate(&message))),
            )
            .await;
            return Err(EngageflowError::Step(err));
        }

        self.fail(args, name, err.reason_code(), err.to_string()).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn defer(
        &self,
        args: &StepTaskArgs,
        step: &RegisteredStep,
        next: StepTaskArgs,
        delay: Duration,
        (hold, count): (Hold, u32),
        reason: &str,
        result: Value,
    ) -> Result<StepOutcome, EngageflowError> {
        let name = step.capabilities.kind.key();
        let enqueued = self
            .queue
            .enqueue(&step.capabilities.queue_name, next, Some(delay))
            .await?;
        let retry_after = now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let (subject_id, run_id) = (&args.subject_id, &args.run_id);
        let (queue_name, task_id) = (&enqueued.queue_name, &enqueued.task_id);
        let written = match hold {
            Hold::Deferral => {
                self.store
                    .mark_step_queued(
                        subject_id,
                        run_id,
                        name,
                        queue_name,
                        task_id,
                        Some(result),
                        Some(retry_after),
                    )
                    .await?
            }
            Hold::Wait => {
                self.store
                    .mark_step_waiting(
                        subject_id,
                        run_id,
                        name,
                        queue_name,
                        task_id,
                        Some(result),
                        Some(retry_after),
                    )
                    .await?
            }
        };
        if !written.is_applied() {
            debug!("Step settled while deferring; the re-enqueued task will drop itself");
            return Ok(StepOutcome::from_write(written));
        }

        let attempts = count + 1;
        info!(
            reason = %reason,
            hold = hold.as_str(),
            attempts,
            retry_in_seconds = delay.as_secs(),
            task_id = %enqueued.task_id,
            "Step deferred"
        );
        self.emit(
            args,
            PipelineEvent::step("deferred", name, 0)
                .add_detail("reason", json!(reason))
                .add_detail("hold", json!(hold.as_str()))
                .add_detail("attempts", json!(attempts))
                .add_detail("retry_in_seconds", json!(delay.as_secs())),
        )
        .await;

        Ok(StepOutcome::Deferred {
            attempts,
            retry_in: delay,
            reason: reason.to_string(),
        })
    }

    async fn fail(
        &self,
        args: &StepTaskArgs,
        name: &str,
        reason: &str,
        message: String,
    ) -> Result<StepOutcome, EngageflowError> {
        let written = self
            .store
            .mark_step_completed(
                &args.subject_id,
                &args.run_id,
                name,
                StepCompletion::Failed {
                    reason: reason.to_string(),
                    error: message.clone(),
                    result: None,
                },
            )
            .await?;
        if !written.is_applied() {
            return Ok(StepOutcome::from_write(written));
        }

        warn!(reason = %reason, error = %message, "Step failed");
        self.emit(
            args,
            PipelineEvent::step("failed", name, 100)
                .add_detail("reason", json!(reason))
                .add_detail("error", json!(self.truncate(&message))),
        )
        .await;
        Ok(StepOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    async fn skip(
        &self,
        args: &StepTaskArgs,
        name: &str,
        reason: String,
    ) -> Result<StepOutcome, EngageflowError> {
        let result = json!({ "skipped": true, "reason": reason });
        let written = self
            .store
            .mark_step_completed(
                &args.subject_id,
                &args.run_id,
                name,
                StepCompletion::Succeeded {
                    result: result.clone(),
                },
            )
            .await?;
        if !written.is_applied() {
            return Ok(StepOutcome::from_write(written));
        }

        info!(reason = %reason, "Step skipped");
        self.emit(
            args,
            PipelineEvent::step("skipped", name, 100).add_detail("reason", json!(reason)),
        )
        .await;
        Ok(StepOutcome::Succeeded { result })
    }

    fn truncate(&self, message: &str) -> String {
        truncate_chars(message, self.config.error_max_chars)
    }

    async fn emit(&self, args: &StepTaskArgs, event: PipelineEvent) {
        self.events
            .emit(event.for_run(&args.subject_id, &args.run_id))
            .await;
    }
}
