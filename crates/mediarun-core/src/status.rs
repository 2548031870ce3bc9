//! Task status and the allowed transitions between states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a generation Task.
///
/// ```text
/// PENDING --start--> RUNNING --success--> SUCCEEDED
///    |                  |
///    +--cancel--> FAILED <--failure/cancel--+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task accepted and waiting for an executor slot.
    #[default]
    Pending,
    /// Reserved for pre-admission rate limiting. Never entered by the engine.
    Throttled,
    /// Task is executing on a worker.
    Running,
    /// Task produced its output.
    Succeeded,
    /// Task failed or was cancelled.
    Failed,
}

impl TaskStatus {
    /// All statuses, in declaration order.
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Throttled,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
    ];

    /// Returns true if no further transition may leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the edge `self -> next` exists in the task state graph.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }

    /// Wire name, e.g. `"RUNNING"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Throttled => "THROTTLED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in TaskStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in TaskStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_running_never_returns_to_pending() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_throttled_is_never_entered_or_left() {
        for other in TaskStatus::ALL {
            assert!(!TaskStatus::Throttled.can_transition_to(other));
            assert!(!other.can_transition_to(TaskStatus::Throttled));
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(json, "\"SUCCEEDED\"");
    }
}
