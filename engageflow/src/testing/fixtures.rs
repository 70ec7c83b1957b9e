//! Fixtures and an in-process engine harness.

use std::sync::Arc;

use super::ScriptedBackend;
use crate::engine::{Engine, EngineBuilder};
use crate::errors::EngageflowError;
use crate::events::CollectingEventSink;
use crate::executor::StepOutcome;
use crate::queue::{InMemoryTaskQueue, QueuedTask};
use crate::state::PipelineRun;
use crate::subject::{InMemorySubjectRepository, SubjectKind, SubjectRecord};

/// Upper bound on deliveries per [`TestEngine::drain`] call.
const MAX_DELIVERIES: usize = 500;

/// A post with media, caption and owner: every built-in step can run on it.
#[must_use]
pub fn fixture_post(id: &str) -> SubjectRecord {
    SubjectRecord::new(id, SubjectKind::Post)
        .with_media(format!("/media/{id}.jpg"))
        .with_caption("Sunset over the bay #travel #sunset with @bob")
        .with_owner("alice")
}

/// A delivered task and what handling it returned.
#[derive(Debug)]
pub struct Delivery {
    /// The task as it was enqueued.
    pub task: QueuedTask,
    /// The dispatcher's answer.
    pub outcome: Result<StepOutcome, EngageflowError>,
}

/// An engine over in-memory boundaries with a scripted backend.
///
/// Queue delays are ignored: [`drain`](Self::drain) delivers every pending
/// task immediately until the queue stays empty.
#[derive(Debug)]
pub struct TestEngine {
    /// The engine under test.
    pub engine: Engine,
    /// Subject storage.
    pub repo: Arc<InMemorySubjectRepository>,
    /// Recording queue.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Captured events.
    pub events: Arc<CollectingEventSink>,
    /// Scripted analysis backends.
    pub backend: ScriptedBackend,
}

impl TestEngine {
    /// Creates a harness with the built-in steps and an allow-all guard.
    pub fn new() -> Result<Self, EngageflowError> {
        Self::with_builder(|builder| builder)
    }

    /// Creates a harness, letting the caller adjust the builder.
    pub fn with_builder(
        configure: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Result<Self, EngageflowError> {
        let repo = Arc::new(InMemorySubjectRepository::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let events = Arc::new(CollectingEventSink::new());
        let backend = ScriptedBackend::new();

        let builder = Engine::builder(repo.clone(), queue.clone())
            .ports(backend.ports())
            .events(events.clone());
        let engine = configure(builder).build()?;

        Ok(Self {
            engine,
            repo,
            queue,
            events,
            backend,
        })
    }

    /// Stores a subject.
    pub fn insert(&self, subject: SubjectRecord) {
        self.repo.insert(subject);
    }

    /// Delivers pending tasks, including those enqueued while delivering,
    /// until the queue is empty.
    pub async fn drain(&self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while deliveries.len() < MAX_DELIVERIES {
            let batch = self.queue.take_all();
            if batch.is_empty() {
                break;
            }
            for task in batch {
                let outcome = self.engine.handle_task(&task.task_id, &task.args).await;
                deliveries.push(Delivery { task, outcome });
            }
        }
        deliveries
    }

    /// Reads a run, failing loudly if it is gone.
    pub async fn run(&self, subject_id: &str, run_id: &str) -> Result<PipelineRun, EngageflowError> {
        self.engine
            .pipeline(subject_id, run_id)
            .await?
            .ok_or_else(|| EngageflowError::Store(format!("run '{run_id}' not found")))
    }
}
