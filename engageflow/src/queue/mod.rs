//! Task queue boundary.
//!
//! Every step runs as its own task. The engine only needs to enqueue a task
//! by queue name with an optional delay and learn the task id it was given;
//! delivery, acknowledgement and worker processes belong to the host.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::EngageflowError;
use crate::state::RunOptions;
use crate::utils::{generate_task_id, now_utc, Timestamp};

/// Arguments carried by every step task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTaskArgs {
    /// Subject being analysed.
    pub subject_id: String,
    /// Run the task belongs to.
    pub run_id: String,
    /// Step the task executes.
    pub step: String,
    /// Inference provider.
    #[serde(default)]
    pub provider: Option<String>,
    /// Model name.
    #[serde(default)]
    pub model: Option<String>,
    /// Who triggered the run.
    #[serde(default)]
    pub requested_by: Option<String>,
    /// Resource-guard deferrals so far.
    #[serde(default)]
    pub defer_attempt: u32,
    /// Task-level redeliveries after transient errors.
    #[serde(default)]
    pub retry_attempt: u32,
}

impl StepTaskArgs {
    /// Creates first-delivery arguments for a step.
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        run_id: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            run_id: run_id.into(),
            step: step.into(),
            provider: None,
            model: None,
            requested_by: None,
            defer_attempt: 0,
            retry_attempt: 0,
        }
    }

    /// Copies provider/model selection from run options.
    #[must_use]
    pub fn with_options(mut self, options: &RunOptions) -> Self {
        self.provider.clone_from(&options.provider);
        self.model.clone_from(&options.model);
        self.requested_by.clone_from(&options.requested_by);
        self
    }

    /// Arguments for the next deferred delivery.
    #[must_use]
    pub fn deferred(&self) -> Self {
        Self {
            defer_attempt: self.defer_attempt + 1,
            ..self.clone()
        }
    }

    /// Arguments for the next transient-retry delivery.
    #[must_use]
    pub fn retried(&self) -> Self {
        Self {
            retry_attempt: self.retry_attempt + 1,
            ..self.clone()
        }
    }

    /// Arguments for the same run, targeting another step.
    #[must_use]
    pub fn for_step(&self, step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            defer_attempt: 0,
            retry_attempt: 0,
            ..self.clone()
        }
    }
}

/// Identity of an enqueued task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueuedTask {
    /// Queue-assigned task id.
    pub task_id: String,
    /// Queue the task was placed on.
    pub queue_name: String,
}

/// A task as recorded by [`InMemoryTaskQueue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    /// Queue-assigned task id.
    pub task_id: String,
    /// Queue the task was placed on.
    pub queue_name: String,
    /// Task arguments.
    pub args: StepTaskArgs,
    /// Requested delivery delay.
    pub delay: Option<Duration>,
    /// When the task was enqueued.
    pub enqueued_at: Timestamp,
}

/// Queue accepting step tasks.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueues a step task, delivered no earlier than `delay` from now.
    async fn enqueue(
        &self,
        queue_name: &str,
        args: StepTaskArgs,
        delay: Option<Duration>,
    ) -> Result<EnqueuedTask, EngageflowError>;
}

/// Recording queue for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    pending: Mutex<Vec<QueuedTask>>,
    history: Mutex<Vec<QueuedTask>>,
    fail_next: Mutex<u32>,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` enqueues fail.
    pub fn fail_next(&self, count: u32) {
        *self.fail_next.lock() = count;
    }

    /// Tasks not yet taken, in enqueue order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedTask> {
        self.pending.lock().clone()
    }

    /// Removes and returns every pending task.
    pub fn take_all(&self) -> Vec<QueuedTask> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Every task ever enqueued.
    #[must_use]
    pub fn history(&self) -> Vec<QueuedTask> {
        self.history.lock().clone()
    }

    /// Every task ever enqueued for a step.
    #[must_use]
    pub fn tasks_for(&self, step: &str) -> Vec<QueuedTask> {
        self.history
            .lock()
            .iter()
            .filter(|task| task.args.step == step)
            .cloned()
            .collect()
    }

    /// Number of pending tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns true if no tasks are pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        args: StepTaskArgs,
        delay: Option<Duration>,
    ) -> Result<EnqueuedTask, EngageflowError> {
        {
            let mut failures = self.fail_next.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(EngageflowError::Queue(format!(
                    "broker unavailable for queue '{queue_name}'"
                )));
            }
        }

        let task = QueuedTask {
            task_id: generate_task_id(),
            queue_name: queue_name.to_string(),
            args,
            delay,
            enqueued_at: now_utc(),
        };
        let enqueued = EnqueuedTask {
            task_id: task.task_id.clone(),
            queue_name: task.queue_name.clone(),
        };
        self.history.lock().push(task.clone());
        self.pending.lock().push(task);
        Ok(enqueued)
    }
}
