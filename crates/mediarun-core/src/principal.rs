//! Principals (API key owners) and their credit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ModelKind, PrincipalId, TaskId};

/// An authenticated caller that owns a credit balance and its tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,

    /// Human-readable key name.
    pub name: String,

    /// SHA-256 hex digest of the raw API key.
    pub key_hash: String,

    /// Remaining credits.
    pub credit_balance: u64,

    /// Revoked keys are rejected at authentication.
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

impl Principal {
    /// Create a new active principal.
    pub fn new(name: impl Into<String>, key_hash: impl Into<String>, credit_balance: u64) -> Self {
        Self {
            id: PrincipalId::generate(),
            name: name.into(),
            key_hash: key_hash.into(),
            credit_balance,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Whether the balance covers `cost`.
    pub fn can_afford(&self, cost: u64) -> bool {
        self.credit_balance >= cost
    }
}

/// One debit against a principal's balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditUsage {
    pub principal: PrincipalId,
    pub task: TaskId,
    pub model: ModelKind,
    pub credits: u64,
    pub used_at: DateTime<Utc>,
}

impl CreditUsage {
    pub fn new(principal: PrincipalId, task: TaskId, model: ModelKind, credits: u64) -> Self {
        Self {
            principal,
            task,
            model,
            credits,
            used_at: Utc::now(),
        }
    }
}
