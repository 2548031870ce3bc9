//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for MediaRun.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Model name does not map to any known model.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Endpoint name does not map to any known endpoint.
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// Progress reported for a task that is not running.
    #[error("Cannot record progress while task is {0}")]
    NotRunning(TaskStatus),
}
