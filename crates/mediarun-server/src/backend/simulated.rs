//! Simulated loaders and backends.
//!
//! These stand in for real models during development and in tests. A
//! simulated run sleeps through a fixed number of steps, reporting progress
//! after each one, and produces a small JSON document describing the request.

use std::any::Any;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use mediarun_core::ModelKind;

use super::{Backend, BackendError, BackendOutput, ModelInstance, ModelLoader, ProgressSink};
use crate::config::SimulationConfig;

/// A "loaded" simulated model.
#[derive(Debug)]
pub struct SimulatedModel {
    pub model: ModelKind,
    pub invocations: u64,
}

impl ModelInstance for SimulatedModel {
    fn release(&mut self) {
        info!(model = %self.model, invocations = self.invocations, "Releasing simulated model");
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Loader that produces [`SimulatedModel`]s after a fixed delay.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLoader {
    delay: Duration,
}

impl SimulatedLoader {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(Duration::from_millis(config.load_delay_ms))
    }
}

impl ModelLoader for SimulatedLoader {
    fn load(&self, model: ModelKind) -> Result<Box<dyn ModelInstance>, BackendError> {
        debug!(model = %model, "Loading simulated model");
        std::thread::sleep(self.delay);
        Ok(Box::new(SimulatedModel {
            model,
            invocations: 0,
        }))
    }
}

/// Backend that walks through `steps` sleeps and reports progress evenly.
///
/// An input carrying `"simulateFailure": "<message>"` fails once the run is
/// past its midpoint, which is handy for exercising the failure path by hand.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    steps: u8,
    step_delay: Duration,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self {
            steps: 4,
            step_delay: Duration::ZERO,
        }
    }
}

impl SimulatedBackend {
    pub fn new(steps: u8, step_delay: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step_delay,
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(config.steps, Duration::from_millis(config.step_delay_ms))
    }
}

impl Backend for SimulatedBackend {
    fn invoke(
        &self,
        input: &Value,
        instance: &mut dyn ModelInstance,
        progress: &ProgressSink,
    ) -> Result<BackendOutput, BackendError> {
        let model = instance
            .as_any_mut()
            .downcast_mut::<SimulatedModel>()
            .ok_or(BackendError::IncompatibleInstance)?;
        if !input.is_object() {
            return Err(BackendError::InvalidInput("expected a JSON object".to_string()));
        }
        model.invocations += 1;

        let failure = input.get("simulateFailure").and_then(Value::as_str);

        for step in 1..=self.steps {
            if progress.is_cancelled() {
                return Err(BackendError::Execution("cancelled".to_string()));
            }
            std::thread::sleep(self.step_delay);

            let percent = u16::from(step) * 100 / u16::from(self.steps);
            if let Some(message) = failure {
                if percent > 50 {
                    return Err(BackendError::Execution(message.to_string()));
                }
            }
            progress.report(u8::try_from(percent).unwrap_or(100));
        }

        let document = json!({
            "model": model.model,
            "invocation": model.invocations,
            "input": input,
            "generatedAt": chrono::Utc::now().to_rfc3339(),
        });
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| BackendError::Execution(e.to_string()))?;
        Ok(BackendOutput::new(bytes, "json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn sink() -> (ProgressSink, mpsc::UnboundedReceiver<u8>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (ProgressSink::new(tx, cancel.clone()), rx, cancel)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<u8>) -> Vec<u8> {
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        seen
    }

    #[test]
    fn test_simulated_run_reports_steps() {
        let mut instance = SimulatedLoader::default().load(ModelKind::Kokoro).unwrap();
        let (progress, mut rx, _) = sink();

        let output = SimulatedBackend::default()
            .invoke(&json!({"text": "hi"}), instance.as_mut(), &progress)
            .unwrap();

        assert_eq!(output.extension, "json");
        let doc: Value = serde_json::from_slice(&output.bytes).unwrap();
        assert_eq!(doc["model"], "kokoro");
        assert_eq!(doc["input"]["text"], "hi");
        assert_eq!(drain(&mut rx), vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_simulated_failure_after_midpoint() {
        let mut instance = SimulatedLoader::default().load(ModelKind::FluxDev).unwrap();
        let (progress, mut rx, _) = sink();

        let err = SimulatedBackend::default()
            .invoke(
                &json!({"simulateFailure": "CUDA out of memory"}),
                instance.as_mut(),
                &progress,
            )
            .unwrap_err();

        assert_eq!(err.to_string(), "CUDA out of memory");
        assert_eq!(drain(&mut rx), vec![25, 50]);
    }

    #[test]
    fn test_cancelled_run_stops() {
        let mut instance = SimulatedLoader::default().load(ModelKind::Rvc).unwrap();
        let (progress, mut rx, cancel) = sink();
        cancel.cancel();

        assert!(SimulatedBackend::default()
            .invoke(&json!({}), instance.as_mut(), &progress)
            .is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_non_object_input_rejected() {
        let mut instance = SimulatedLoader::default().load(ModelKind::Demucs).unwrap();
        let (progress, _rx, _) = sink();
        assert!(matches!(
            SimulatedBackend::default().invoke(&json!("audio.wav"), instance.as_mut(), &progress),
            Err(BackendError::InvalidInput(_))
        ));
    }
}
