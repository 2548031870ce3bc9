//! Task execution.
//!
//! The executor runs one task from `PENDING` to a terminal state: it leases
//! the model from the pool, invokes the backend on the blocking thread pool,
//! persists progress as it arrives, stores the output, and finally writes the
//! terminal status and fires the webhook. Failures never escape `run`; they
//! become a `FAILED` task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mediarun_core::{ModelKind, Task, TaskId};

use crate::backend::{BackendError, BackendRegistry, ProgressSink};
use crate::notify::{notify_terminal, Notifier};
use crate::pool::{ModelPool, PoolError};
use crate::storage::{BlobStorage, StorageError};
use crate::store::{StoreError, TaskStore, TaskUpdate};

/// Error message written when a caller cancels a task.
pub const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// Why a task run did not produce output.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No backend registered for model {0}")]
    BackendNotFound(ModelKind),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Backend panicked during invocation")]
    Panicked,

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
}

/// Cancellation tokens of tasks currently owned by a worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl CancellationRegistry {
    fn register(&self, id: &TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), token.clone());
        token
    }

    fn remove(&self, id: &TaskId) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Trip the token of `id`. Returns false if no worker holds the task.
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of tasks currently held by workers.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Runs tasks to completion.
pub struct TaskExecutor {
    pool: Arc<ModelPool>,
    backends: Arc<BackendRegistry>,
    tasks: Arc<dyn TaskStore>,
    storage: Arc<dyn BlobStorage>,
    notifier: Arc<dyn Notifier>,
    cancellations: CancellationRegistry,
}

impl TaskExecutor {
    pub fn new(
        pool: Arc<ModelPool>,
        backends: Arc<BackendRegistry>,
        tasks: Arc<dyn TaskStore>,
        storage: Arc<dyn BlobStorage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            backends,
            tasks,
            storage,
            notifier,
            cancellations: CancellationRegistry::default(),
        }
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Run a task to a terminal state.
    ///
    /// A task that is no longer `PENDING` (cancelled while queued) is skipped.
    pub async fn run(&self, task_id: TaskId) {
        let cancel = self.cancellations.register(&task_id);
        self.run_registered(&task_id, cancel).await;
        self.cancellations.remove(&task_id);
    }

    async fn run_registered(&self, task_id: &TaskId, cancel: CancellationToken) {
        let task = match self.tasks.update(task_id, Box::new(|t| t.start())).await {
            Ok(task) => task,
            Err(StoreError::Transition(e)) => {
                info!(task_id = %task_id, reason = %e, "Skipping task that is no longer pending");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to start task");
                return;
            }
        };
        info!(task_id = %task_id, model = %task.model, "Task started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ProgressSink::new(tx, cancel);

        let outcome = {
            let execution = self.execute(&task, sink);
            tokio::pin!(execution);
            loop {
                tokio::select! {
                    outcome = &mut execution => break outcome,
                    Some(percent) = rx.recv() => self.record_progress(task_id, percent).await,
                }
            }
        };
        while let Ok(percent) = rx.try_recv() {
            self.record_progress(task_id, percent).await;
        }

        self.finalize(task_id, outcome).await;
    }

    async fn execute(&self, task: &Task, sink: ProgressSink) -> Result<Vec<String>, ExecutionError> {
        let backend = self
            .backends
            .get(&task.model)
            .cloned()
            .ok_or(ExecutionError::BackendNotFound(task.model))?;
        if sink.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        // A cancelled task gives up its place instead of loading or queueing
        // behind the model lock.
        let lease = tokio::select! {
            lease = self.pool.get(task.model) => lease?,
            _ = sink.cancelled() => return Err(ExecutionError::Cancelled),
        };
        let mut guard = tokio::select! {
            guard = lease.lock() => guard,
            _ = sink.cancelled() => return Err(ExecutionError::Cancelled),
        };
        if sink.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        debug!(task_id = %task.id, model = %task.model, "Invoking backend");

        let input = task.input.clone();
        let cancel = sink.clone();
        let output = tokio::task::spawn_blocking(move || backend.invoke(&input, &mut *guard, &sink))
            .await
            .map_err(|_| ExecutionError::Panicked)??;

        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let name = format!("{}.{}", task.id, output.extension);
        let location = self.storage.store(output.bytes, &name).await?;
        Ok(vec![location])
    }

    async fn record_progress(&self, task_id: &TaskId, percent: u8) {
        let update: TaskUpdate = Box::new(move |t| t.record_progress(percent).map(|_| ()));
        if let Err(e) = self.tasks.update(task_id, update).await {
            debug!(task_id = %task_id, percent, error = %e, "Dropping progress report");
        }
    }

    /// Write the terminal status for a run and notify.
    ///
    /// If the task already became terminal (cancelled), the outcome is dropped.
    async fn finalize(&self, task_id: &TaskId, outcome: Result<Vec<String>, ExecutionError>) {
        let update: TaskUpdate = match outcome {
            Ok(output) => Box::new(move |t| t.succeed(output)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Task failed");
                let message = e.to_string();
                Box::new(move |t| t.fail(message))
            }
        };

        match self.tasks.update(task_id, update).await {
            Ok(task) => {
                info!(task_id = %task_id, status = %task.status, "Task finished");
                notify_terminal(self.notifier.as_ref(), &task).await;
            }
            Err(StoreError::Transition(e)) => {
                info!(task_id = %task_id, reason = %e, "Discarding outcome of already finished task");
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to record task outcome");
            }
        }
    }

    /// Fail a pending or running task on the caller's behalf.
    ///
    /// The terminal write happens immediately; a running backend is asked to
    /// stop through its progress sink, and whatever it returns afterwards is
    /// discarded. The webhook is delivered in the background.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        let task = self
            .tasks
            .update(task_id, Box::new(|t| t.fail(CANCELLED_MESSAGE)))
            .await?;
        let running = self.cancellations.cancel(task_id);
        info!(task_id = %task_id, running, "Task cancelled");

        let notifier = self.notifier.clone();
        let cancelled = task.clone();
        tokio::spawn(async move {
            notify_terminal(notifier.as_ref(), &cancelled).await;
        });
        Ok(task)
    }
}
