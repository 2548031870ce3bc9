//! Admission of generation requests.
//!
//! Admission checks a request against policy, debits the caller, persists a
//! `PENDING` task and queues it. It never waits on generation.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use mediarun_core::{CreditUsage, Endpoint, ModelKind, PrincipalId, Task, TaskId};

use crate::backend::BackendRegistry;
use crate::config::BillingConfig;
use crate::dispatch::{DispatchError, Dispatcher, QueuePermit};
use crate::store::{PrincipalStore, StoreError, TaskStore};

/// Reasons a request is refused.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Unknown or inactive principal: {0}")]
    UnknownPrincipal(PrincipalId),

    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(Endpoint),

    #[error("Insufficient credits: {cost} required, {balance} available")]
    InsufficientCredits { cost: u64, balance: u64 },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Server is overloaded, try again later")]
    Overloaded,

    #[error("Queue unavailable: {0}")]
    Unavailable(DispatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Admission aborted: {0}")]
    Aborted(String),
}

/// A generation request as received from a caller.
#[derive(Debug, Clone)]
pub struct Submission {
    pub principal: PrincipalId,
    pub model: String,
    pub endpoint: Endpoint,
    pub input: Value,
    pub webhook: Option<String>,
}

/// Validates and enqueues requests.
pub struct AdmissionController {
    billing: BillingConfig,
    backends: Arc<BackendRegistry>,
    tasks: Arc<dyn TaskStore>,
    principals: Arc<dyn PrincipalStore>,
    dispatcher: Arc<Dispatcher>,
}

impl AdmissionController {
    pub fn new(
        billing: BillingConfig,
        backends: Arc<BackendRegistry>,
        tasks: Arc<dyn TaskStore>,
        principals: Arc<dyn PrincipalStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            billing,
            backends,
            tasks,
            principals,
            dispatcher,
        }
    }

    /// Admit a request and return the id of the queued task.
    pub async fn submit(&self, submission: Submission) -> Result<TaskId, AdmissionError> {
        let Submission {
            principal,
            model,
            endpoint,
            input,
            webhook,
        } = submission;

        let owner = match self.principals.get(&principal).await {
            Ok(p) if p.active => p,
            Ok(_) | Err(StoreError::NotFound(_)) => {
                return Err(AdmissionError::UnknownPrincipal(principal))
            }
            Err(e) => return Err(e.into()),
        };

        let cost = self
            .billing
            .cost(endpoint)
            .ok_or(AdmissionError::UnknownEndpoint(endpoint))?;

        if !owner.can_afford(cost) {
            return Err(AdmissionError::InsufficientCredits {
                cost,
                balance: owner.credit_balance,
            });
        }

        let model: ModelKind = model
            .parse()
            .map_err(|_| AdmissionError::UnknownModel(model.clone()))?;
        if !self.backends.contains_key(&model) {
            return Err(AdmissionError::UnknownModel(model.to_string()));
        }

        let permit = self.dispatcher.reserve(model.queue()).map_err(|e| match e {
            DispatchError::Overloaded(_) => AdmissionError::Overloaded,
            DispatchError::Closed(_) => AdmissionError::Unavailable(e),
        })?;

        let task = Task::new(principal.clone(), model, endpoint, input, webhook);
        let task_id = task.id.clone();

        // Once money moves, the debit, the insert and the hand-off finish
        // together even if the caller goes away.
        let handle = tokio::spawn(commit(
            self.tasks.clone(),
            self.principals.clone(),
            permit,
            task,
            cost,
        ));
        let balance = handle
            .await
            .map_err(|e| AdmissionError::Aborted(e.to_string()))??;

        info!(
            task_id = %task_id,
            principal = %principal,
            model = %model,
            endpoint = %endpoint,
            cost,
            balance,
            "Task admitted"
        );
        Ok(task_id)
    }
}

/// Debit the owner, persist the task and queue it. Returns the new balance.
async fn commit(
    tasks: Arc<dyn TaskStore>,
    principals: Arc<dyn PrincipalStore>,
    permit: QueuePermit,
    task: Task,
    cost: u64,
) -> Result<u64, AdmissionError> {
    let task_id = task.id.clone();
    let owner = task.owner.clone();

    // The balance may have moved since admission checked it; the debit re-checks it.
    let usage = CreditUsage::new(owner.clone(), task_id.clone(), task.model, cost);
    let balance = principals.try_debit(usage).await.map_err(|e| match e {
        StoreError::InsufficientBalance { balance, cost } => {
            AdmissionError::InsufficientCredits { cost, balance }
        }
        other => AdmissionError::Store(other),
    })?;

    if let Err(e) = tasks.insert(task).await {
        warn!(task_id = %task_id, error = %e, "Failed to persist task, refunding");
        if let Err(refund) = principals.refund(&owner, cost).await {
            warn!(principal = %owner, error = %refund, "Refund failed");
        }
        return Err(e.into());
    }

    permit.send(task_id);
    Ok(balance)
}
