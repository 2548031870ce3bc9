//! Persistence for tasks and principals.
//!
//! The engine only talks to these traits. [`InMemoryStore`] keeps everything
//! in process memory, which is enough for a single-node deployment and for
//! tests; records do not survive a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use mediarun_core::{CoreError, CreditUsage, Principal, PrincipalId, Task, TaskId};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error(transparent)]
    Transition(#[from] CoreError),

    #[error("Insufficient balance: {balance} < {cost}")]
    InsufficientBalance { balance: u64, cost: u64 },
}

/// Mutation applied to a task record under the store's lock.
pub type TaskUpdate = Box<dyn FnOnce(&mut Task) -> Result<(), CoreError> + Send>;

/// Task persistence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    async fn get(&self, id: &TaskId) -> Result<Task, StoreError>;

    /// Apply `update` atomically and return the resulting record.
    ///
    /// If `update` fails the stored record is left unchanged.
    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, StoreError>;

    /// All tasks, oldest first.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;
}

/// Principal and credit ledger persistence.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn insert(&self, principal: Principal) -> Result<(), StoreError>;

    async fn get(&self, id: &PrincipalId) -> Result<Principal, StoreError>;

    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Principal>, StoreError>;

    /// Check the balance covers `usage.credits` and debit it, atomically.
    ///
    /// Records `usage` in the ledger and returns the remaining balance.
    async fn try_debit(&self, usage: CreditUsage) -> Result<u64, StoreError>;

    /// Return credits to a principal. Used when a debited request is never persisted.
    async fn refund(&self, id: &PrincipalId, credits: u64) -> Result<u64, StoreError>;

    /// Ledger rows for one principal, oldest first.
    async fn usage(&self, id: &PrincipalId) -> Result<Vec<CreditUsage>, StoreError>;

    async fn list(&self) -> Result<Vec<Principal>, StoreError>;
}

/// In-memory implementation of both stores.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    principals: RwLock<HashMap<PrincipalId, Principal>>,
    ledger: RwLock<Vec<CreditUsage>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(task.id.to_string()));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &TaskId, update: TaskUpdate) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut next = task.clone();
        update(&mut next)?;
        *task = next.clone();
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

#[async_trait]
impl PrincipalStore for InMemoryStore {
    async fn insert(&self, principal: Principal) -> Result<(), StoreError> {
        let mut principals = self.principals.write().await;
        if principals.contains_key(&principal.id) {
            return Err(StoreError::Conflict(principal.id.to_string()));
        }
        principals.insert(principal.id.clone(), principal);
        Ok(())
    }

    async fn get(&self, id: &PrincipalId) -> Result<Principal, StoreError> {
        self.principals
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .principals
            .read()
            .await
            .values()
            .find(|p| p.key_hash == key_hash)
            .cloned())
    }

    async fn try_debit(&self, usage: CreditUsage) -> Result<u64, StoreError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .get_mut(&usage.principal)
            .ok_or_else(|| StoreError::NotFound(usage.principal.to_string()))?;

        if !principal.can_afford(usage.credits) {
            return Err(StoreError::InsufficientBalance {
                balance: principal.credit_balance,
                cost: usage.credits,
            });
        }
        principal.credit_balance -= usage.credits;
        let balance = principal.credit_balance;

        // Ledger is written while the balance lock is held so the two agree.
        self.ledger.write().await.push(usage);
        Ok(balance)
    }

    async fn refund(&self, id: &PrincipalId, credits: u64) -> Result<u64, StoreError> {
        let mut principals = self.principals.write().await;
        let principal = principals
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        principal.credit_balance = principal.credit_balance.saturating_add(credits);
        Ok(principal.credit_balance)
    }

    async fn usage(&self, id: &PrincipalId) -> Result<Vec<CreditUsage>, StoreError> {
        Ok(self
            .ledger
            .read()
            .await
            .iter()
            .filter(|u| &u.principal == id)
            .cloned()
            .collect())
    }

    async fn list(&self) -> Result<Vec<Principal>, StoreError> {
        let mut principals: Vec<_> = self.principals.read().await.values().cloned().collect();
        principals.sort_by_key(|p| p.created_at);
        Ok(principals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediarun_core::{Endpoint, ModelKind, TaskStatus};
    use serde_json::json;
    use std::sync::Arc;

    fn task() -> Task {
        Task::new(
            PrincipalId::new("p1"),
            ModelKind::Kokoro,
            Endpoint::TextToSpeech,
            json!({"text": "hello"}),
            None,
        )
    }

    #[tokio::test]
    async fn test_update_applies_and_returns_record() {
        let store = InMemoryStore::new();
        let t = task();
        let id = t.id.clone();
        TaskStore::insert(&store, t).await.unwrap();

        let updated = store.update(&id, Box::new(|t| t.start())).await.unwrap();
        assert_eq!(updated.status, TaskStatus::Running);
        assert_eq!(TaskStore::get(&store, &id).await.unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_record_unchanged() {
        let store = InMemoryStore::new();
        let t = task();
        let id = t.id.clone();
        TaskStore::insert(&store, t).await.unwrap();

        let err = store
            .update(&id, Box::new(|t| t.succeed(vec!["x".to_string()])))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transition(_)));

        let stored = TaskStore::get(&store, &id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert!(stored.output.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let store = InMemoryStore::new();
        let err = store
            .update(&TaskId::new("nope"), Box::new(|t| t.start()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = InMemoryStore::new();
        let t = task();
        TaskStore::insert(&store, t.clone()).await.unwrap();
        assert!(matches!(
            TaskStore::insert(&store, t).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_debit_records_usage() {
        let store = InMemoryStore::new();
        let p = Principal::new("default", "hash", 10);
        let id = p.id.clone();
        PrincipalStore::insert(&store, p).await.unwrap();

        let usage = CreditUsage::new(id.clone(), TaskId::new("t1"), ModelKind::Kokoro, 4);
        assert_eq!(store.try_debit(usage).await.unwrap(), 6);

        let rows = store.usage(&id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].credits, 4);

        let too_much = CreditUsage::new(id.clone(), TaskId::new("t2"), ModelKind::Kokoro, 7);
        assert!(matches!(
            store.try_debit(too_much).await,
            Err(StoreError::InsufficientBalance { balance: 6, cost: 7 })
        ));
        assert_eq!(store.usage(&id).await.unwrap().len(), 1);
        assert_eq!(PrincipalStore::get(&store, &id).await.unwrap().credit_balance, 6);
    }

    #[tokio::test]
    async fn test_concurrent_debits_never_overdraw() {
        let store = Arc::new(InMemoryStore::new());
        let p = Principal::new("default", "hash", 10);
        let id = p.id.clone();
        PrincipalStore::insert(store.as_ref(), p).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    let usage =
                        CreditUsage::new(id, TaskId::new(format!("t{i}")), ModelKind::Rvc, 3);
                    store.try_debit(usage).await.is_ok()
                })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 3);
        assert_eq!(PrincipalStore::get(store.as_ref(), &id).await.unwrap().credit_balance, 1);
    }

    #[tokio::test]
    async fn test_find_by_key_hash_and_refund() {
        let store = InMemoryStore::new();
        let p = Principal::new("ci", "abc123", 2);
        let id = p.id.clone();
        PrincipalStore::insert(&store, p).await.unwrap();

        assert!(store.find_by_key_hash("abc123").await.unwrap().is_some());
        assert!(store.find_by_key_hash("zzz").await.unwrap().is_none());
        assert_eq!(store.refund(&id, 5).await.unwrap(), 7);
    }
}
