//! MediaRun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Storage backends
//! - Runtime specifics
//!
//! The task state machine lives here so every layer above it goes through
//! the same transition checks.

pub mod error;
pub mod ids;
pub mod model;
pub mod principal;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{PrincipalId, TaskId};
pub use model::{Endpoint, ModelKind, Queue};
pub use principal::{CreditUsage, Principal};
pub use status::TaskStatus;
pub use task::{Task, TaskSnapshot, MAX_ERROR_LEN, RUNNING_PROGRESS_CAP, STARTED_PROGRESS};
