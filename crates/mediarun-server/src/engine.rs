//! Wiring of the pool, executor, dispatcher and admission into one engine.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use mediarun_core::{CreditUsage, ModelKind, Principal, PrincipalId, Queue, Task, TaskId, TaskSnapshot};

use crate::admission::{AdmissionController, AdmissionError, Submission};
use crate::auth;
use crate::backend::{missing_backends, Backend, BackendRegistry, SimulatedBackend, SimulatedLoader};
use crate::config::{ConfigError, ServerConfig};
use crate::dispatch::Dispatcher;
use crate::executor::TaskExecutor;
use crate::notify::{NotificationError, Notifier, WebhookNotifier};
use crate::pool::{ModelPool, PoolError, PoolSnapshot};
use crate::storage::{BlobStorage, LocalStorage, StorageError, UploadSlot};
use crate::store::{InMemoryStore, PrincipalStore, StoreError, TaskStore};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("No backend registered for models: {0:?}")]
    MissingBackends(Vec<ModelKind>),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task {0} has already finished")]
    AlreadyTerminal(TaskId),

    #[error("Invalid or revoked API key")]
    Unauthorized,

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Collaborators the engine is assembled from.
pub struct Components {
    pub pool: ModelPool,
    pub backends: BackendRegistry,
    pub tasks: Arc<dyn TaskStore>,
    pub principals: Arc<dyn PrincipalStore>,
    pub storage: Arc<dyn BlobStorage>,
    pub notifier: Arc<dyn Notifier>,
}

impl Components {
    /// Simulated models, in-memory stores, local outputs and HTTP webhooks.
    pub fn simulated(config: &ServerConfig) -> Result<Self, EngineError> {
        let loader = Arc::new(SimulatedLoader::from_config(&config.simulation));
        let backend: Arc<dyn Backend> = Arc::new(SimulatedBackend::from_config(&config.simulation));
        let store = Arc::new(InMemoryStore::new());

        Ok(Self {
            pool: ModelPool::from_config(&config.pool, loader),
            backends: ModelKind::ALL
                .into_iter()
                .map(|model| (model, backend.clone()))
                .collect(),
            tasks: store.clone(),
            principals: store,
            storage: Arc::new(LocalStorage::new(
                &config.outputs_dir,
                config.public_base_url.as_str(),
            )),
            notifier: Arc::new(WebhookNotifier::new(Duration::from_secs(
                config.webhook_timeout_secs,
            ))?),
        })
    }
}

/// The generation service core.
pub struct Engine {
    config: ServerConfig,
    executor: Arc<TaskExecutor>,
    dispatcher: Arc<Dispatcher>,
    admission: AdmissionController,
    tasks: Arc<dyn TaskStore>,
    principals: Arc<dyn PrincipalStore>,
    storage: Arc<dyn BlobStorage>,
}

impl Engine {
    /// Validate the components against the configuration and start workers.
    ///
    /// Refuses to start if any model lacks a loader or a backend, or cannot
    /// fit the memory budget on its own.
    pub fn start(config: ServerConfig, components: Components) -> Result<Self, EngineError> {
        config.validate()?;
        components.pool.validate()?;
        let missing = missing_backends(&components.backends);
        if !missing.is_empty() {
            return Err(EngineError::MissingBackends(missing));
        }

        let pool = Arc::new(components.pool);
        let backends = Arc::new(components.backends);
        let executor = Arc::new(TaskExecutor::new(
            pool,
            backends.clone(),
            components.tasks.clone(),
            components.storage.clone(),
            components.notifier,
        ));
        let dispatcher = Arc::new(Dispatcher::start(
            executor.clone(),
            Queue::ALL.map(|queue| (queue, config.queue(queue))),
        ));
        let admission = AdmissionController::new(
            config.billing.clone(),
            backends,
            components.tasks.clone(),
            components.principals.clone(),
            dispatcher.clone(),
        );

        info!(budget = config.pool.budget, "Engine started");
        Ok(Self {
            config,
            executor,
            dispatcher,
            admission,
            tasks: components.tasks,
            principals: components.principals,
            storage: components.storage,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Admit a generation request.
    pub async fn submit(&self, submission: Submission) -> Result<TaskId, AdmissionError> {
        self.admission.submit(submission).await
    }

    pub async fn task(&self, id: &TaskId) -> Result<Task, EngineError> {
        self.tasks.get(id).await.map_err(|e| match e {
            StoreError::NotFound(_) => EngineError::TaskNotFound(id.clone()),
            other => other.into(),
        })
    }

    pub async fn get_status(&self, id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        Ok(TaskSnapshot::from(&self.task(id).await?))
    }

    pub async fn tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self.tasks.list().await?)
    }

    /// Cancel a pending or running task.
    pub async fn cancel(&self, id: &TaskId) -> Result<TaskSnapshot, EngineError> {
        match self.executor.cancel(id).await {
            Ok(task) => Ok(TaskSnapshot::from(&task)),
            Err(StoreError::NotFound(_)) => Err(EngineError::TaskNotFound(id.clone())),
            Err(StoreError::Transition(_)) => Err(EngineError::AlreadyTerminal(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Create a principal and return its plaintext API key with the record.
    pub async fn create_principal(
        &self,
        name: &str,
        credit_balance: Option<u64>,
    ) -> Result<(String, Principal), EngineError> {
        let (key, key_hash) = auth::generate_api_key();
        let principal = Principal::new(
            name,
            key_hash,
            credit_balance.unwrap_or(self.config.default_credit_balance),
        );
        self.principals.insert(principal.clone()).await?;
        info!(principal = %principal.id, name = %principal.name, "API key created");
        Ok((key, principal))
    }

    pub async fn principals(&self) -> Result<Vec<Principal>, EngineError> {
        Ok(self.principals.list().await?)
    }

    /// Resolve an API key to an active principal.
    pub async fn authenticate(&self, key: &str) -> Result<Principal, EngineError> {
        match self.principals.find_by_key_hash(&auth::hash_key(key)).await? {
            Some(principal) if principal.active => Ok(principal),
            _ => Err(EngineError::Unauthorized),
        }
    }

    pub async fn principal(&self, id: &PrincipalId) -> Result<Principal, EngineError> {
        Ok(self.principals.get(id).await?)
    }

    /// Debits recorded against a principal, oldest first.
    pub async fn usage(&self, id: &PrincipalId) -> Result<Vec<CreditUsage>, EngineError> {
        Ok(self.principals.usage(id).await?)
    }

    /// Issue an upload slot for an input file.
    pub fn upload_slot(&self, filename: &str) -> Result<UploadSlot, EngineError> {
        let slot = self.storage.upload_slot(filename)?;
        info!(upload = %slot.id, filename, "Upload slot issued");
        Ok(slot)
    }

    /// Store the bytes of an issued upload slot and return its URI.
    pub async fn receive_upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, EngineError> {
        Ok(self.storage.receive_upload(name, bytes).await?)
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.executor.pool().snapshot()
    }

    pub fn queue_depths(&self) -> Vec<(Queue, usize)> {
        self.dispatcher.queue_depths()
    }

    /// Tasks currently held by a worker.
    pub fn active_runs(&self) -> usize {
        self.executor.cancellations().active()
    }

    /// Stop admitting work and wait for queued tasks to finish.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
