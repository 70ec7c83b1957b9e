//! Pipeline state store.
//!
//! Reads and writes [`PipelineRun`] aggregates embedded in a subject's
//! metadata blob. Every mutation is a guarded read-modify-write so terminal
//! step outcomes and the finalized run status can only be written once.
//!
//! The per-subject lock serializes writers inside one process. Across
//! processes the repository's versioned save decides: a write that lost the
//! race reloads the blob and re-applies its mutation.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::locks::SubjectLocks;
use super::model::{GenerationMarker, PipelineMetadata, PipelineRun, StepState};
use crate::core::{RunStatus, StepStatus};
use crate::errors::EngageflowError;
use crate::subject::{SaveOutcome, SubjectRecord, SubjectRepository};
use crate::utils::{now_utc, truncate_chars, Timestamp};

/// Default number of runs retained per subject.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

/// Default maximum length of a stored error string.
pub const DEFAULT_ERROR_MAX_CHARS: usize = 280;

/// Reload-and-reapply rounds before a contended write gives up.
pub const MAX_WRITE_CONFLICTS: u32 = 16;

/// Result of a guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The mutation was applied and persisted.
    Applied,
    /// The guard rejected the mutation; nothing was written.
    Unchanged,
    /// The subject or run no longer exists.
    Missing,
}

impl WriteOutcome {
    /// Returns true if the mutation was persisted.
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Terminal outcome recorded for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepCompletion {
    /// The step finished successfully.
    Succeeded {
        /// Projected result summary.
        result: Value,
    },
    /// The step failed permanently.
    Failed {
        /// Reason code.
        reason: String,
        /// Error message, truncated on write.
        error: String,
        /// Optional partial result.
        result: Option<Value>,
    },
}

impl StepCompletion {
    fn status(&self) -> StepStatus {
        match self {
            Self::Succeeded { .. } => StepStatus::Succeeded,
            Self::Failed { .. } => StepStatus::Failed,
        }
    }
}

/// Persisted per-subject pipeline state machine.
pub struct PipelineStateStore {
    repository: Arc<dyn SubjectRepository>,
    locks: SubjectLocks,
    history_limit: usize,
    error_max_chars: usize,
}

impl std::fmt::Debug for PipelineStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStateStore")
            .field("history_limit", &self.history_limit)
            .field("error_max_chars", &self.error_max_chars)
            .finish_non_exhaustive()
    }
}

impl PipelineStateStore {
    /// Creates a store over a subject repository.
    #[must_use]
    pub fn new(repository: Arc<dyn SubjectRepository>) -> Self {
        Self {
            repository,
            locks: SubjectLocks::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            error_max_chars: DEFAULT_ERROR_MAX_CHARS,
        }
    }

    /// Sets how many runs are retained per subject.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Sets the maximum stored error length.
    #[must_use]
    pub fn with_error_max_chars(mut self, max_chars: usize) -> Self {
        self.error_max_chars = max_chars;
        self
    }

    // ---- reads -----------------------------------------------------------

    /// Loads the subject record.
    pub async fn load_subject(
        &self,
        subject_id: &str,
    ) -> Result<Option<SubjectRecord>, EngageflowError> {
        self.repository.load(subject_id).await
    }

    /// Loads the subject together with one of its runs.
    pub async fn load_context(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Option<(SubjectRecord, PipelineRun)>, EngageflowError> {
        let Some(subject) = self.repository.load(subject_id).await? else {
            return Ok(None);
        };
        let mut metadata = PipelineMetadata::from_blob(&subject.metadata)?;
        Ok(metadata.runs.remove(run_id).map(|run| (subject, run)))
    }

    /// Returns the run, or `None` if the subject or run is gone.
    pub async fn pipeline_for(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Option<PipelineRun>, EngageflowError> {
        Ok(self.load_context(subject_id, run_id).await?.map(|(_, run)| run))
    }

    /// Returns the most recently started run id.
    pub async fn latest_run_id(&self, subject_id: &str) -> Result<Option<String>, EngageflowError> {
        let Some(subject) = self.repository.load(subject_id).await? else {
            return Ok(None);
        };
        Ok(PipelineMetadata::from_blob(&subject.metadata)?.latest_run_id)
    }

    /// Returns true if the step is terminal. Missing runs count as terminal.
    pub async fn step_terminal(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
    ) -> Result<bool, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map_or(true, |run| run.step_terminal(step)))
    }

    /// Returns true if the run is finalized. Missing runs count as terminal.
    pub async fn pipeline_terminal(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<bool, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map_or(true, |run| run.is_terminal()))
    }

    /// Failed steps of the run.
    pub async fn failed_steps(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map(|run| run.failed_steps())
            .unwrap_or_default())
    }

    /// Failed steps whose failure fails the run.
    pub async fn failed_required_steps(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map(|run| run.failed_required_steps())
            .unwrap_or_default())
    }

    /// Awaited steps not yet terminal.
    pub async fn steps_requiring_execution(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map(|run| run.steps_requiring_execution())
            .unwrap_or_default())
    }

    /// Steps enqueued only after finalization.
    pub async fn deferred_steps(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Vec<String>, EngageflowError> {
        Ok(self
            .pipeline_for(subject_id, run_id)
            .await?
            .map(|run| run.deferred_steps)
            .unwrap_or_default())
    }

    // ---- writes ----------------------------------------------------------

    /// Persists a freshly planned run and marks it as the latest.
    pub async fn start_pipeline(&self, run: PipelineRun) -> Result<WriteOutcome, EngageflowError> {
        let subject_id = run.subject_id.clone();
        let _guard = self.locks.acquire(&subject_id).await;

        for _ in 0..MAX_WRITE_CONFLICTS {
            let Some(subject) = self.repository.load(&subject_id).await? else {
                return Ok(WriteOutcome::Missing);
            };
            let mut blob = subject.metadata;
            let mut metadata = PipelineMetadata::from_blob(&blob)?;
            if metadata.runs.contains_key(&run.run_id) {
                return Ok(WriteOutcome::Unchanged);
            }

            let status = run.status.to_string();
            metadata.latest_run_id = Some(run.run_id.clone());
            metadata.runs.insert(run.run_id.clone(), run.clone());
            metadata.prune(self.history_limit);
            metadata.write_into(&mut blob)?;

            match self
                .repository
                .save_metadata(&subject_id, subject.version, blob, Some(status))
                .await?
            {
                SaveOutcome::Saved => return Ok(WriteOutcome::Applied),
                SaveOutcome::Missing => return Ok(WriteOutcome::Missing),
                SaveOutcome::Conflict => {
                    debug!(subject_id = %subject_id, run_id = %run.run_id, "Write conflict, reloading");
                }
            }
        }
        Err(write_conflict(&subject_id))
    }

    /// Transitions a pending step to queued ahead of its first dispatch.
    /// Only succeeds once per step, which makes it the dispatch claim.
    pub async fn claim_step_dispatch(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        queue_name: &str,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.write(subject_id, run_id, |run| {
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.status != StepStatus::Pending {
                return false;
            }
            state.status = StepStatus::Queued;
            state.queue_name = Some(queue_name.to_string());
            true
        })
        .await
    }

    /// Hands a claimed step back to `Pending` when its task never reached
    /// the queue, so a later dispatch can claim it again. Steps that already
    /// have a task are left alone.
    pub async fn release_step_claim(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.write(subject_id, run_id, |run| {
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.status != StepStatus::Queued || state.active_task_id.is_some() {
                return false;
            }
            state.status = StepStatus::Pending;
            state.queue_name = None;
            true
        })
        .await
    }

    /// Records the identity of the task now responsible for a step.
    pub async fn record_step_task(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        queue_name: &str,
        task_id: &str,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.write(subject_id, run_id, |run| {
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.is_terminal() {
                return false;
            }
            if state.status == StepStatus::Pending {
                state.status = StepStatus::Queued;
            }
            state.queue_name = Some(queue_name.to_string());
            state.active_task_id = Some(task_id.to_string());
            true
        })
        .await
    }

    /// Marks a step as running. Repeated calls refresh the execution
    /// identity; terminal steps are never touched.
    pub async fn mark_step_running(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        queue_name: &str,
        active_task_id: Option<&str>,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.write(subject_id, run_id, |run| {
            let now = now_utc();
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.is_terminal() {
                return false;
            }
            state.status = StepStatus::Running;
            state.queue_name = Some(queue_name.to_string());
            state.active_task_id = active_task_id.map(str::to_string);
            state.retry_after = None;
            if state.started_at.is_none() {
                state.started_at = Some(now);
            }

            if run.status == RunStatus::Queued {
                run.status = RunStatus::Running;
                run.started_at = Some(now);
            }
            true
        })
        .await
    }

    /// Records a resource-guard deferral: status back to queued,
    /// `attempts` + 1.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_step_queued(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        queue_name: &str,
        active_task_id: &str,
        result: Option<Value>,
        retry_after: Option<Timestamp>,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.requeue(
            subject_id,
            run_id,
            step,
            Requeue {
                queue_name,
                active_task_id,
                result,
                retry_after,
            },
            |state| state.attempts += 1,
        )
        .await
    }

    /// Records a readiness wait: status back to queued, `reason_waits` + 1.
    /// Guard deferrals are counted separately and are not affected.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_step_waiting(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        queue_name: &str,
        active_task_id: &str,
        result: Option<Value>,
        retry_after: Option<Timestamp>,
    ) -> Result<WriteOutcome, EngageflowError> {
        self.requeue(
            subject_id,
            run_id,
            step,
            Requeue {
                queue_name,
                active_task_id,
                result,
                retry_after,
            },
            |state| state.reason_waits += 1,
        )
        .await
    }

    async fn requeue(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        requeue: Requeue<'_>,
        count: impl Fn(&mut StepState),
    ) -> Result<WriteOutcome, EngageflowError> {
        self.write(subject_id, run_id, |run| {
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.is_terminal() {
                return false;
            }
            state.status = StepStatus::Queued;
            count(state);
            state.queue_name = Some(requeue.queue_name.to_string());
            state.active_task_id = Some(requeue.active_task_id.to_string());
            state.retry_after = requeue.retry_after;
            if requeue.result.is_some() {
                state.result = requeue.result.clone();
            }
            true
        })
        .await
    }

    /// Parks a step whose task hit a transient error until the task-level
    /// retry is redelivered. Does not count as a deferred attempt.
    pub async fn mark_step_awaiting_retry(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        error: &str,
    ) -> Result<WriteOutcome, EngageflowError> {
        let error = truncate_chars(error, self.error_max_chars);
        self.write(subject_id, run_id, |run| {
            let Some(state) = run.step_mut(step) else {
                return false;
            };
            if state.is_terminal() {
                return false;
            }
            state.status = StepStatus::Queued;
            state.error = Some(error.clone());
            true
        })
        .await
    }

    /// Writes a terminal step outcome. A step that is already terminal is
    /// left untouched and `Unchanged` is returned.
    pub async fn mark_step_completed(
        &self,
        subject_id: &str,
        run_id: &str,
        step: &str,
        completion: StepCompletion,
    ) -> Result<WriteOutcome, EngageflowError> {
        let max_chars = self.error_max_chars;
        let outcome = self
            .write(subject_id, run_id, |run| {
                let Some(state) = run.step_mut(step) else {
                    return false;
                };
                if state.is_terminal() {
                    return false;
                }
                state.status = completion.status();
                state.finished_at = Some(now_utc());
                state.retry_after = None;
                match completion.clone() {
                    StepCompletion::Succeeded { result } => {
                        state.result = Some(result);
                        state.error = None;
                        state.failure_reason = None;
                    }
                    StepCompletion::Failed {
                        reason,
                        error,
                        result,
                    } => {
                        if result.is_some() {
                            state.result = result;
                        }
                        state.error = Some(truncate_chars(&error, max_chars));
                        state.failure_reason = Some(reason);
                    }
                }
                true
            })
            .await?;

        if outcome == WriteOutcome::Unchanged {
            debug!(
                subject_id = %subject_id,
                run_id = %run_id,
                step = %step,
                "Ignoring completion for a step that is already terminal"
            );
        }
        Ok(outcome)
    }

    /// Finalizes the run. Only the first caller that finds every awaited step
    /// terminal wins; everyone else gets `false`.
    pub async fn mark_pipeline_finished(
        &self,
        subject_id: &str,
        run_id: &str,
        status: RunStatus,
        details: Value,
    ) -> Result<bool, EngageflowError> {
        if !status.is_terminal() {
            return Err(EngageflowError::Config(format!(
                "cannot finish pipeline with non-terminal status '{status}'"
            )));
        }

        let failure_reason = details
            .get("failure_reason")
            .and_then(Value::as_str)
            .map(str::to_string);

        let outcome = self
            .write(subject_id, run_id, |run| {
                if run.is_terminal() || !run.steps_requiring_execution().is_empty() {
                    return false;
                }
                let now = now_utc();
                run.status = status;
                run.finished_at = Some(now);
                run.started_at.get_or_insert(now);
                run.summary = Some(details.clone());
                run.failure_reason = failure_reason.clone();
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Opens the generation phase. Returns true only for the first caller.
    pub async fn mark_generation_started(
        &self,
        subject_id: &str,
        run_id: &str,
        opened_by: &str,
    ) -> Result<bool, EngageflowError> {
        let outcome = self
            .write(subject_id, run_id, |run| {
                if run.generation.is_some() || run.is_terminal() {
                    return false;
                }
                run.generation = Some(GenerationMarker {
                    opened_by: opened_by.to_string(),
                    started_at: now_utc(),
                });
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Records that deferred steps were handed to the queue. Returns true only
    /// for the first caller.
    pub async fn mark_deferred_enqueued(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<bool, EngageflowError> {
        let outcome = self
            .write(subject_id, run_id, |run| {
                if run.deferred_enqueued_at.is_some() {
                    return false;
                }
                run.deferred_enqueued_at = Some(now_utc());
                true
            })
            .await?;
        Ok(outcome.is_applied())
    }

    /// Locked, versioned read-modify-write over one run. `mutate` returns
    /// whether it changed anything; unchanged runs are not written back. On a
    /// version conflict the run is reloaded and `mutate` runs again against
    /// the fresh state, so its guard sees what the competing writer did.
    async fn write<F>(
        &self,
        subject_id: &str,
        run_id: &str,
        mut mutate: F,
    ) -> Result<WriteOutcome, EngageflowError>
    where
        F: FnMut(&mut PipelineRun) -> bool,
    {
        let _guard = self.locks.acquire(subject_id).await;

        for _ in 0..MAX_WRITE_CONFLICTS {
            let Some(subject) = self.repository.load(subject_id).await? else {
                return Ok(WriteOutcome::Missing);
            };
            let mut blob = subject.metadata;
            let mut metadata = PipelineMetadata::from_blob(&blob)?;
            let is_latest = metadata.latest_run_id.as_deref() == Some(run_id);

            let Some(run) = metadata.runs.get_mut(run_id) else {
                return Ok(WriteOutcome::Missing);
            };
            if !mutate(run) {
                return Ok(WriteOutcome::Unchanged);
            }
            run.updated_at = Some(now_utc());
            let ai_status = is_latest.then(|| run.status.to_string());

            metadata.write_into(&mut blob)?;
            match self
                .repository
                .save_metadata(subject_id, subject.version, blob, ai_status)
                .await?
            {
                SaveOutcome::Saved => return Ok(WriteOutcome::Applied),
                SaveOutcome::Missing => {
                    warn!(
                        subject_id = %subject_id,
                        run_id = %run_id,
                        "Subject disappeared while its pipeline state was being written"
                    );
                    return Ok(WriteOutcome::Missing);
                }
                SaveOutcome::Conflict => {
                    debug!(subject_id = %subject_id, run_id = %run_id, "Write conflict, reloading");
                }
            }
        }
        Err(write_conflict(subject_id))
    }
}

struct Requeue<'a> {
    queue_name: &'a str,
    active_task_id: &'a str,
    result: Option<Value>,
    retry_after: Option<Timestamp>,
}

fn write_conflict(subject_id: &str) -> EngageflowError {
    EngageflowError::Store(format!(
        "gave up writing pipeline state of subject '{subject_id}' after {MAX_WRITE_CONFLICTS} conflicting writes"
    ))
}
