//! Backend seam: model loaders, generation backends and progress reporting.
//!
//! Loading and invocation are blocking calls. The pool and the executor run
//! them on the blocking thread pool, so implementations may hold the thread
//! for as long as the model needs.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mediarun_core::ModelKind;

pub mod simulated;

pub use simulated::{SimulatedBackend, SimulatedLoader};

/// Errors raised by loaders and backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The request input is missing or has the wrong shape.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The instance handed to a backend was produced by a different loader.
    #[error("Backend received an incompatible model instance")]
    IncompatibleInstance,

    /// Any failure inside the model itself.
    #[error("{0}")]
    Execution(String),
}

/// A loaded model, owned by the pool while resident.
pub trait ModelInstance: Any + Send {
    /// Free the resources held by the instance. Called once, on eviction.
    fn release(&mut self) {}

    /// Access to the concrete type, for backends that downcast.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces model instances.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model: ModelKind) -> Result<Box<dyn ModelInstance>, BackendError>;
}

/// Raw result of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendOutput {
    pub bytes: Vec<u8>,
    /// File extension without the leading dot.
    pub extension: String,
}

impl BackendOutput {
    pub fn new(bytes: Vec<u8>, extension: impl Into<String>) -> Self {
        Self {
            bytes,
            extension: extension.into(),
        }
    }
}

/// A per-model generation function.
pub trait Backend: Send + Sync {
    fn invoke(
        &self,
        input: &Value,
        instance: &mut dyn ModelInstance,
        progress: &ProgressSink,
    ) -> Result<BackendOutput, BackendError>;
}

/// Backends keyed by the model they serve.
pub type BackendRegistry = HashMap<ModelKind, Arc<dyn Backend>>;

/// Handed to a backend so it can report progress and observe cancellation.
///
/// Reports are forwarded to the executor, which persists them; the backend
/// never touches the task store directly.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<u8>,
    cancel: CancellationToken,
}

impl ProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<u8>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Report progress as a percentage. Values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        // The receiver is gone once the task is finalized; late reports are dropped.
        let _ = self.tx.send(percent.min(100));
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the task is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Models in `ModelKind::ALL` with no entry in `registry`.
pub fn missing_backends(registry: &BackendRegistry) -> Vec<ModelKind> {
    ModelKind::ALL
        .into_iter()
        .filter(|model| !registry.contains_key(model))
        .collect()
}
