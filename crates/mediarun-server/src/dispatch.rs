//! Bounded per-queue worker pools.
//!
//! Each queue owns a bounded channel of task ids drained by a fixed number of
//! worker tasks. Admission reserves a slot before it persists anything, so a
//! full queue is refused up front instead of growing without bound.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, OwnedPermit};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mediarun_core::{Queue, TaskId};

use crate::config::QueueConfig;
use crate::executor::TaskExecutor;

/// Dispatch errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Queue {0} is full")]
    Overloaded(Queue),

    #[error("Queue {0} is not accepting tasks")]
    Closed(Queue),
}

/// A reserved slot in a queue.
///
/// Dropping the permit without sending gives the slot back.
pub struct QueuePermit {
    queue: Queue,
    permit: OwnedPermit<TaskId>,
}

impl QueuePermit {
    /// Hand a persisted task to the queue's workers.
    pub fn send(self, task_id: TaskId) {
        debug!(queue = %self.queue, task_id = %task_id, "Task queued");
        self.permit.send(task_id);
    }
}

struct WorkerPool {
    capacity: usize,
    tx: RwLock<Option<mpsc::Sender<TaskId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Routes tasks to their queue's workers.
pub struct Dispatcher {
    pools: HashMap<Queue, WorkerPool>,
}

impl Dispatcher {
    /// Spawn the workers of every queue.
    pub fn start(
        executor: Arc<TaskExecutor>,
        queues: impl IntoIterator<Item = (Queue, QueueConfig)>,
    ) -> Self {
        let pools = queues
            .into_iter()
            .map(|(queue, config)| (queue, spawn_pool(queue, config, executor.clone())))
            .collect();
        Self { pools }
    }

    /// Reserve a slot in `queue` without waiting.
    pub fn reserve(&self, queue: Queue) -> Result<QueuePermit, DispatchError> {
        let tx = self
            .pools
            .get(&queue)
            .and_then(|pool| pool.tx.read().unwrap_or_else(PoisonError::into_inner).clone())
            .ok_or(DispatchError::Closed(queue))?;

        match tx.try_reserve_owned() {
            Ok(permit) => Ok(QueuePermit { queue, permit }),
            Err(TrySendError::Full(_)) => Err(DispatchError::Overloaded(queue)),
            Err(TrySendError::Closed(_)) => Err(DispatchError::Closed(queue)),
        }
    }

    /// Tasks waiting in (or reserved for) each queue.
    pub fn queue_depths(&self) -> Vec<(Queue, usize)> {
        let mut depths: Vec<_> = self
            .pools
            .iter()
            .map(|(queue, pool)| {
                let free = pool
                    .tx
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_ref()
                    .map_or(pool.capacity, |tx| tx.capacity());
                (*queue, pool.capacity - free)
            })
            .collect();
        depths.sort_by_key(|(queue, _)| *queue);
        depths
    }

    /// Stop accepting tasks, let workers drain their queues, and wait for them.
    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.tx
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }

        for (queue, pool) in &self.pools {
            let workers =
                std::mem::take(&mut *pool.workers.lock().unwrap_or_else(PoisonError::into_inner));
            for handle in workers {
                if let Err(e) = handle.await {
                    warn!(queue = %queue, error = %e, "Worker exited abnormally");
                }
            }
        }
        info!("Dispatcher stopped");
    }
}

fn spawn_pool(queue: Queue, config: QueueConfig, executor: Arc<TaskExecutor>) -> WorkerPool {
    let (tx, rx) = mpsc::channel(config.capacity);
    let rx = Arc::new(AsyncMutex::new(rx));

    let workers = (0..config.workers)
        .map(|index| {
            let rx = rx.clone();
            let executor = executor.clone();
            tokio::spawn(async move { worker_loop(queue, index, rx, executor).await })
        })
        .collect();

    info!(
        queue = %queue,
        workers = config.workers,
        capacity = config.capacity,
        "Worker pool started"
    );

    WorkerPool {
        capacity: config.capacity,
        tx: RwLock::new(Some(tx)),
        workers: Mutex::new(workers),
    }
}

async fn worker_loop(
    queue: Queue,
    index: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<TaskId>>>,
    executor: Arc<TaskExecutor>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(task_id) = next else { break };
        debug!(queue = %queue, worker = index, task_id = %task_id, "Worker picked up task");
        executor.run(task_id).await;
    }
    debug!(queue = %queue, worker = index, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use mediarun_core::{Endpoint, ModelKind, PrincipalId, Task, TaskStatus};

    use crate::backend::{Backend, BackendRegistry, SimulatedBackend, SimulatedLoader};
    use crate::config::PoolConfig;
    use crate::notify::testing::RecordingNotifier;
    use crate::pool::ModelPool;
    use crate::storage::LocalStorage;
    use crate::store::{InMemoryStore, TaskStore};

    fn executor(store: Arc<InMemoryStore>) -> Arc<TaskExecutor> {
        let backend: Arc<dyn Backend> = Arc::new(SimulatedBackend::default());
        let backends: BackendRegistry = ModelKind::ALL
            .into_iter()
            .map(|m| (m, backend.clone()))
            .collect();
        let dir = std::env::temp_dir().join(format!("mediarun-dispatch-{}", uuid::Uuid::new_v4()));
        Arc::new(TaskExecutor::new(
            Arc::new(ModelPool::from_config(
                &PoolConfig::default(),
                Arc::new(SimulatedLoader::default()),
            )),
            Arc::new(backends),
            store,
            Arc::new(LocalStorage::new(dir, "http://localhost/outputs")),
            Arc::new(RecordingNotifier::default()),
        ))
    }

    fn single(queue: Queue, workers: usize, capacity: usize) -> Vec<(Queue, QueueConfig)> {
        vec![(queue, QueueConfig { workers, capacity })]
    }

    #[tokio::test]
    async fn test_dispatched_tasks_run_to_completion() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::start(executor(store.clone()), single(Queue::Audio, 2, 8));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = Task::new(
                PrincipalId::new("p1"),
                ModelKind::Kokoro,
                Endpoint::TextToSpeech,
                json!({}),
                None,
            );
            ids.push(task.id.clone());
            TaskStore::insert(store.as_ref(), task).await.unwrap();
            dispatcher.reserve(Queue::Audio).unwrap().send(ids.last().unwrap().clone());
        }

        dispatcher.shutdown().await;

        for id in &ids {
            let task = TaskStore::get(store.as_ref(), id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::start(executor(store), single(Queue::Video, 1, 1));

        let permit = dispatcher.reserve(Queue::Video).unwrap();
        assert_eq!(dispatcher.queue_depths(), vec![(Queue::Video, 1)]);
        assert_eq!(
            dispatcher.reserve(Queue::Video).err(),
            Some(DispatchError::Overloaded(Queue::Video))
        );

        drop(permit);
        assert!(dispatcher.reserve(Queue::Video).is_ok());
    }

    #[tokio::test]
    async fn test_reserve_after_shutdown_is_closed() {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Dispatcher::start(executor(store), single(Queue::Image, 1, 4));
        dispatcher.shutdown().await;

        assert_eq!(
            dispatcher.reserve(Queue::Image).err(),
            Some(DispatchError::Closed(Queue::Image))
        );
        assert_eq!(
            dispatcher.reserve(Queue::Audio).err(),
            Some(DispatchError::Closed(Queue::Audio))
        );
    }
}
