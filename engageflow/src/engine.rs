//! The assembled engine.

use std::sync::Arc;
use tracing::debug;

use crate::config::EngineConfig;
use crate::coordinator::{FanOutCoordinator, PipelineSummary, RunPlan, StepDispatcher};
use crate::errors::EngageflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::{StepOutcome, StepRunner};
use crate::guard::{AllowAllGuard, LoadProbe, ResourceGuard, ThresholdResourceGuard};
use crate::kv::{InMemoryKeyValueStore, KeyValueStore};
use crate::observability::init_tracing;
use crate::queue::{StepTaskArgs, TaskQueue};
use crate::state::{PipelineRun, PipelineStateStore};
use crate::steps::{AnalysisPorts, StepRegistry};
use crate::subject::SubjectRepository;

/// Builder wiring the engine's collaborators together.
pub struct EngineBuilder {
    repository: Arc<dyn SubjectRepository>,
    queue: Arc<dyn TaskQueue>,
    kv: Option<Arc<dyn KeyValueStore>>,
    guard: Option<Arc<dyn ResourceGuard>>,
    probe: Option<Arc<dyn LoadProbe>>,
    events: Option<Arc<dyn EventSink>>,
    registry: Option<StepRegistry>,
    ports: Option<AnalysisPorts>,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("has_registry", &self.registry.is_some())
            .field("has_ports", &self.ports.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Starts a builder from the two mandatory host boundaries.
    #[must_use]
    pub fn new(repository: Arc<dyn SubjectRepository>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            repository,
            queue,
            kv: None,
            guard: None,
            probe: None,
            events: None,
            registry: None,
            ports: None,
            config: EngineConfig::default(),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses the built-in steps backed by these ports.
    #[must_use]
    pub fn ports(mut self, ports: AnalysisPorts) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Uses a custom step registry instead of the built-in steps.
    #[must_use]
    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the key-value store for guard slots and reason-wait counters.
    #[must_use]
    pub fn kv(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Sets an explicit resource guard.
    #[must_use]
    pub fn guard(mut self, guard: Arc<dyn ResourceGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Builds a threshold guard on top of this probe, using the guard
    /// section of the configuration. Ignored when a guard is set.
    #[must_use]
    pub fn load_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validates the configuration and assembles the engine.
    pub fn build(self) -> Result<Engine, EngageflowError> {
        self.config.validate()?;

        let mut registry = match (self.registry, &self.ports) {
            (Some(registry), _) => registry,
            (None, Some(ports)) => StepRegistry::builtin(ports)?,
            (None, None) => {
                return Err(EngageflowError::Config(
                    "engine needs either a step registry or analysis ports".into(),
                ))
            }
        };
        for (kind, step) in &self.config.steps {
            registry.configure(*kind, |caps| step.apply(caps))?;
        }
        registry.validate_budgets(self.config.executor.max_total_attempts)?;
        let registry = Arc::new(registry);

        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(InMemoryKeyValueStore::new()));
        let guard: Arc<dyn ResourceGuard> = match (self.guard, self.probe) {
            (Some(guard), _) => guard,
            (None, Some(probe)) => Arc::new(ThresholdResourceGuard::new(
                probe,
                Arc::clone(&kv),
                self.config.guard.clone(),
            )),
            (None, None) => Arc::new(AllowAllGuard),
        };
        let events = self.events.unwrap_or_else(|| Arc::new(NoOpEventSink));

        let store = Arc::new(
            PipelineStateStore::new(self.repository)
                .with_history_limit(self.config.coordinator.history_limit)
                .with_error_max_chars(self.config.executor.error_max_chars),
        );
        let runner = Arc::new(
            StepRunner::new(
                Arc::clone(&store),
                guard,
                Arc::clone(&self.queue),
                kv,
                Arc::clone(&events),
            )
            .with_retry(self.config.retry.clone())
            .with_config(self.config.executor.clone()),
        );
        let coordinator = Arc::new(
            FanOutCoordinator::new(
                Arc::clone(&store),
                Arc::clone(&self.queue),
                events,
                Arc::clone(&registry),
            )
            .with_config(self.config.coordinator.clone()),
        );
        let dispatcher = StepDispatcher::new(
            Arc::clone(&registry),
            runner,
            Arc::clone(&coordinator),
            self.queue,
            Arc::clone(&store),
        );

        debug!(steps = registry.len(), "Engine assembled");
        Ok(Engine {
            config: self.config,
            store,
            registry,
            coordinator,
            dispatcher,
        })
    }
}

/// Entry point for hosts: start runs and hand delivered tasks back in.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    store: Arc<PipelineStateStore>,
    registry: Arc<StepRegistry>,
    coordinator: Arc<FanOutCoordinator>,
    dispatcher: StepDispatcher,
}

impl Engine {
    /// Starts a builder.
    #[must_use]
    pub fn builder(
        repository: Arc<dyn SubjectRepository>,
        queue: Arc<dyn TaskQueue>,
    ) -> EngineBuilder {
        EngineBuilder::new(repository, queue)
    }

    /// Installs the global tracing subscriber from the logging section.
    pub fn init_logging(&self) -> Result<(), EngageflowError> {
        init_tracing(self.config.logging.format, &self.config.logging.filter)
    }

    /// Starts a run and returns its id.
    pub async fn start_run(
        &self,
        subject_id: &str,
        plan: &RunPlan,
    ) -> Result<String, EngageflowError> {
        self.coordinator.start_run(subject_id, plan).await
    }

    /// Handles one delivered step task.
    pub async fn handle_task(
        &self,
        task_id: &str,
        args: &StepTaskArgs,
    ) -> Result<StepOutcome, EngageflowError> {
        self.dispatcher.handle(task_id, args).await
    }

    /// Attempts finalization, for hosts sweeping runs whose last step
    /// does not trigger it.
    pub async fn finalize(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Option<PipelineSummary>, EngageflowError> {
        self.coordinator.finalize(subject_id, run_id).await
    }

    /// Reads a run.
    pub async fn pipeline(
        &self,
        subject_id: &str,
        run_id: &str,
    ) -> Result<Option<PipelineRun>, EngageflowError> {
        self.store.pipeline_for(subject_id, run_id).await
    }

    /// Reads the most recently started run of a subject.
    pub async fn latest_pipeline(
        &self,
        subject_id: &str,
    ) -> Result<Option<PipelineRun>, EngageflowError> {
        let Some(run_id) = self.store.latest_run_id(subject_id).await? else {
            return Ok(None);
        };
        self.store.pipeline_for(subject_id, &run_id).await
    }

    /// The state store.
    #[must_use]
    pub fn store(&self) -> &Arc<PipelineStateStore> {
        &self.store
    }

    /// The step registry.
    #[must_use]
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// The coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<FanOutCoordinator> {
        &self.coordinator
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
