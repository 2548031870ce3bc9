//! The generation Task record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, Endpoint, ModelKind, PrincipalId, TaskId, TaskStatus};

/// Progress written when a task starts, before the backend reports anything.
pub const STARTED_PROGRESS: u8 = 10;

/// Highest progress a task may show while still running.
///
/// 100 is written only together with `SUCCEEDED`.
pub const RUNNING_PROGRESS_CAP: u8 = 99;

/// Maximum length (in characters) of a stored failure message.
pub const MAX_ERROR_LEN: usize = 1000;

/// A media-generation request and everything known about its execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Current status. Only changed through the transition methods below.
    pub status: TaskStatus,

    /// Model that serves the request.
    pub model: ModelKind,

    /// Endpoint the request was billed against.
    pub endpoint: Endpoint,

    /// Request parameters, passed verbatim to the backend.
    pub input: Value,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Percentage in [0, 100].
    pub progress: u8,

    /// Result locations; set only once the task has succeeded.
    pub output: Option<Vec<String>>,

    /// Failure message; set only once the task has failed.
    pub error: Option<String>,

    /// Callback URL notified once the task is terminal.
    pub webhook: Option<String>,

    /// Principal that created the task.
    pub owner: PrincipalId,
}

impl Task {
    /// Create a new Task in `PENDING`.
    pub fn new(
        owner: PrincipalId,
        model: ModelKind,
        endpoint: Endpoint,
        input: Value,
        webhook: Option<String>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            status: TaskStatus::Pending,
            model,
            endpoint,
            input,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            progress: 0,
            output: None,
            error: None,
            webhook,
            owner,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, to: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// `PENDING -> RUNNING`. Sets `started_at` and the liveness progress marker.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(Utc::now());
        self.progress = self.progress.max(STARTED_PROGRESS);
        Ok(())
    }

    /// Record a progress report from a running backend.
    ///
    /// Values below the last recorded progress are clamped up to it, and
    /// values above [`RUNNING_PROGRESS_CAP`] are clamped down. Returns the
    /// progress actually stored.
    pub fn record_progress(&mut self, percent: u8) -> Result<u8, CoreError> {
        if self.status != TaskStatus::Running {
            return Err(CoreError::NotRunning(self.status));
        }
        self.progress = percent.min(RUNNING_PROGRESS_CAP).max(self.progress);
        Ok(self.progress)
    }

    /// `RUNNING -> SUCCEEDED` with the stored output locations.
    pub fn succeed(&mut self, output: Vec<String>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Succeeded)?;
        self.output = Some(output);
        self.error = None;
        self.progress = 100;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// `PENDING | RUNNING -> FAILED` with a bounded error message.
    pub fn fail(&mut self, error: impl AsRef<str>) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.output = None;
        self.error = Some(bounded_message(error.as_ref()));
        self.ended_at = Some(Utc::now());
        Ok(())
    }
}

/// Caller-facing view of a task, as returned by status polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub status: TaskStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Fraction in [0, 1].
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            created_at: Some(task.created_at),
            started_at: task.started_at,
            ended_at: task.ended_at,
            progress: f64::from(task.progress) / 100.0,
            output: match task.status {
                TaskStatus::Succeeded => task.output.clone(),
                _ => None,
            },
            error: match task.status {
                TaskStatus::Failed => task.error.clone(),
                _ => None,
            },
        }
    }
}

fn bounded_message(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "Unknown error".to_string();
    }
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
