//! Fan-out of step tasks and fan-in finalization.

use futures::future::try_join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{CoordinatorConfig, PipelineSummary, RunPlan};
use crate::core::{PipelineEvent, RunMode, StepStatus};
use crate::errors::EngageflowError;
use crate::events::EventSink;
use crate::queue::{EnqueuedTask, StepTaskArgs, TaskQueue};
use crate::state::{PipelineRun, PipelineStateStore, WriteOutcome};
use crate::steps::{StepCapabilities, StepRegistry};
use crate::utils::generate_run_id;

/// Starts runs, dispatches their steps and finalizes them exactly once.
pub struct FanOutCoordinator {
    store: Arc<PipelineStateStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn EventSink>,
    registry: Arc<StepRegistry>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for FanOutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutCoordinator")
            .field("config", &self.config)
            .field("steps", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl FanOutCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<PipelineStateStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventSink>,
        registry: Arc<StepRegistry>,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            registry,
            config: CoordinatorConfig::default(),
        }
    }

    /// Sets coordinator settings.
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates a run for a subject and enqueues its first steps.
    ///
    /// Returns the new run id.
    #[instrument(skip(self, plan))]
    pub async fn start_run(
        &self,
        subject_id: &str,
        plan: &RunPlan,
    ) -> Result<String, EngageflowError> {
        if self.store.load_subject(subject_id).await?.is_none() {
            return Err(EngageflowError::Store(format!(
                "subject '{subject_id}' not found"
            )));
        }

        let run_id = generate_run_id();
        let run = plan.build_run(&self.registry, &run_id, subject_id)?;
        match self.store.start_pipeline(run.clone()).await? {
            WriteOutcome::Applied => {}
            WriteOutcome::Unchanged => {
                return Err(EngageflowError::Store(format!("run '{run_id}' already exists")));
            }
            WriteOutcome::Missing => {
                return Err(EngageflowError::Store(format!(
                    "subject '{subject_id}' disappeared while starting a run"
                )));
            }
        }

        info!(
            run_id = %run_id,
            mode = %run.mode,
            steps = run.steps.len(),
            "Pipeline run started"
        );
        self.events
            .emit(PipelineEvent::pipeline_started(run.steps.len()).for_run(subject_id, &run_id))
            .await;

        self.enqueue_required_steps(&run).await?;
        Ok(run_id)
    }

    /// Enqueues the analysis steps of a fresh run.
    ///
    /// Parallel runs get every analysis step, staggered by the configured
    /// interval; chained runs only the first one.
    pub async fn enqueue_required_steps(
        &self,
        run: &PipelineRun,
    ) -> Result<Vec<EnqueuedTask>, EngageflowError> {
        let names: Vec<String> = match run.mode {
            RunMode::Parallel => run.analysis_steps().map(str::to_string).collect(),
            RunMode::Chain => run.next_pending_analysis_step().into_iter().collect(),
        };

        let dispatches = names.iter().enumerate().map(|(index, name)| {
            let stagger = self.config.stagger_seconds.saturating_mul(index as u64);
            let delay = (stagger > 0).then(|| Duration::from_secs(stagger));
            self.dispatch_step(run, name, delay)
        });
        let enqueued = try_join_all(dispatches).await?;
        Ok(enqueued.into_iter().flatten().collect())
    }

    /// Claims a pending step and enqueues its first task.
    ///
    /// Returns `None` when another caller already dispatched the step. If the
    /// enqueue fails the claim is released, so the step is pending again and
    /// the next follow-up on the run dispatches it.
    pub async fn dispatch_step(
        &self,
        run: &PipelineRun,
        step: &str,
        delay: Option<Duration>,
    ) -> Result<Option<EnqueuedTask>, EngageflowError> {
        let registered = self.registry.resolve(step)?;
        let queue_name = &registered.capabilities.queue_name;

        let claimed = self
            .store
            .claim_step_dispatch(&run.subject_id, &run.run_id, step, queue_name)
            .await?;
        if !claimed.is_applied() {
            debug!(step = %step, outcome = ?claimed, "Step already dispatched");
            return Ok(None);
        }

        let args = StepTaskArgs::new(&run.subject_id, &run.run_id, step).with_options(&run.options);
        let task = match self.queue.enqueue(queue_name, args, delay).await {
            Ok(task) => task,
            Err(err) => {
                warn!(step = %step, error = %err, "Enqueue failed; releasing the dispatch claim");
                if let Err(release) = self
                    .store
                    .release_step_claim(&run.subject_id, &run.run_id, step)
                    .await
                {
                    warn!(step = %step, error = %release, "Could not release the dispatch claim");
                }
                return Err(err);
            }
        };
        self.store
            .record_step_task(&run.subject_id, &run.run_id, step, &task.queue_name, &task.task_id)
            .await?;

        debug!(step = %step, task_id = %task.task_id, queue = %task.queue_name, "Step enqueued");
        self.events
            .emit(
                PipelineEvent::step("queued", step, 0)
                    .for_run(&run.subject_id, &run.run_id)
                    .add_detail("task_id", json!(task.task_id))
                    .add_detail("queue", json!(task.queue_name)),
            )
            .await;
        Ok(Some(task))
    }

    /// Returns true if the run exists, is not finalized and has no awaited
    /// step left to execute.
    pub async fn ready_to_finalize(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<bool, EngageflowError> {
        Ok(self
            .store
            .pipeline_for(subject_id, run_id)
            .await?
            .is_some_and(|run| !run.is_terminal() && run.steps_requiring_execution().is_empty()))
    }

    /// Finalizes the run if every awaited step is terminal.
    ///
    /// Safe to call from any number of completing steps at once: only the
    /// caller that wins the finish write gets the summary. Calling it on an
    /// already finalized run dispatches any deferred step still pending.
    #[instrument(skip(self))]
    pub async fn finalize(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Option<PipelineSummary>, EngageflowError> {
        let Some(run) = self.store.pipeline_for(subject_id, run_id).await? else {
            return Ok(None);
        };
        if run.is_terminal() {
            self.dispatch_deferred(&run).await?;
            return Ok(None);
        }
        if !run.steps_requiring_execution().is_empty() {
            return Ok(None);
        }

        let summary = PipelineSummary::from_run(&run);
        let won = self
            .store
            .mark_pipeline_finished(subject_id, run_id, summary.status, summary.to_value()?)
            .await?;
        if !won {
            debug!("Another completion finalized the run");
            return Ok(None);
        }

        info!(
            status = %summary.status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            duration_ms = summary.duration_ms,
            "Pipeline run finished"
        );
        let mut event = PipelineEvent::pipeline_finished(&summary.status.to_string())
            .for_run(subject_id, run_id)
            .add_detail("failed_steps", json!(summary.failed_steps));
        if let Some(reason) = &summary.failure_reason {
            event = event.add_detail("failure_reason", json!(reason));
        }
        self.events.emit(event).await;

        self.dispatch_deferred(&run).await?;
        Ok(Some(summary))
    }

    /// Dispatches the deferred steps of a finalized run that are still
    /// pending, then records the hand-off. Claims keep concurrent callers
    /// from enqueueing a step twice.
    async fn dispatch_deferred(&self, run: &PipelineRun) -> Result<(), EngageflowError> {
        if run.deferred_steps.is_empty() || run.deferred_enqueued_at.is_some() {
            return Ok(());
        }
        for step in &run.deferred_steps {
            self.dispatch_step(run, step, None).await?;
        }
        if self
            .store
            .mark_deferred_enqueued(&run.subject_id, &run.run_id)
            .await?
        {
            debug!(steps = run.deferred_steps.len(), "Deferred steps handed to the queue");
        }
        Ok(())
    }

    /// Continues a run after one of its steps settled.
    ///
    /// Chained runs dispatch their next analysis step, the generation step
    /// opens once every analysis step settled, and steps that trigger
    /// finalization attempt it. Every continuation is derived from the
    /// persisted run, so calling this again for the same step only redoes
    /// what an earlier call left undone.
    pub async fn after_step(
        &self,
        args: &StepTaskArgs,
        capabilities: &StepCapabilities,
    ) -> Result<Option<PipelineSummary>, EngageflowError> {
        let Some(run) = self.store.pipeline_for(&args.subject_id, &args.run_id).await? else {
            return Ok(None);
        };
        if run.is_terminal() {
            self.dispatch_deferred(&run).await?;
            return Ok(None);
        }
        if run.is_deferred_step(&args.step) {
            return Ok(None);
        }

        if run.mode == RunMode::Chain {
            if let Some(next) = run.next_pending_analysis_step() {
                self.dispatch_step(&run, &next, None).await?;
            }
        }

        if let Some(generation) = run.generation_step.as_deref() {
            let pending = run
                .step(generation)
                .is_some_and(|state| state.status == StepStatus::Pending);
            if generation != args.step && pending && run.analysis_settled() {
                if self
                    .store
                    .mark_generation_started(&args.subject_id, &args.run_id, &args.step)
                    .await?
                {
                    info!(opened_by = %args.step, step = %generation, "Generation phase opened");
                }
                self.dispatch_step(&run, generation, None).await?;
            }
        }

        if capabilities.triggers_finalize {
            return self.finalize(&args.subject_id, &args.run_id).await;
        }
        Ok(None)
    }
}
