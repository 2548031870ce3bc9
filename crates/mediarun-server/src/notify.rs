//! Webhook delivery of terminal task states.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use mediarun_core::{Task, TaskId, TaskStatus};

/// Notification errors.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    Status(u16),
}

/// Body POSTed to a task's webhook once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub id: TaskId,
    pub status: TaskStatus,
    pub output: Vec<String>,
}

impl From<&Task> for WebhookPayload {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            status: task.status,
            output: task.output.clone().unwrap_or_default(),
        }
    }
}

/// Delivers task notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotificationError>;
}

/// Notifier that POSTs JSON over HTTP.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotificationError> {
        debug!(url = %url, task_id = %payload.id, "POST webhook");
        let response = self.client.post(url).json(payload).send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Deliver the webhook for a terminal task, if it has one.
///
/// Delivery is attempted once. Failures are logged and never reach the task.
pub async fn notify_terminal(notifier: &dyn Notifier, task: &Task) {
    let Some(url) = task.webhook.as_deref() else {
        return;
    };
    if !task.is_terminal() {
        warn!(task_id = %task.id, status = %task.status, "Refusing to notify non-terminal task");
        return;
    }

    let payload = WebhookPayload::from(task);
    match notifier.deliver(url, &payload).await {
        Ok(()) => info!(task_id = %task.id, status = %task.status, "Webhook delivered"),
        Err(e) => warn!(task_id = %task.id, url = %url, error = %e, "Webhook delivery failed"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records every delivery and optionally fails them.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub fail: bool,
        pub delivered: Mutex<Vec<(String, WebhookPayload)>>,
    }

    impl RecordingNotifier {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn deliveries(&self) -> Vec<(String, WebhookPayload)> {
            self.delivered.lock().unwrap().clone()
        }

        /// Poll until at least `count` deliveries were attempted.
        pub async fn wait_for(&self, count: usize) -> Vec<(String, WebhookPayload)> {
            for _ in 0..400 {
                let deliveries = self.deliveries();
                if deliveries.len() >= count {
                    return deliveries;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            self.deliveries()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(
            &self,
            url: &str,
            payload: &WebhookPayload,
        ) -> Result<(), NotificationError> {
            self.delivered
                .lock()
                .unwrap()
                .push((url.to_string(), payload.clone()));
            if self.fail {
                return Err(NotificationError::Status(500));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use mediarun_core::{Endpoint, ModelKind, PrincipalId};
    use serde_json::json;

    fn task(webhook: Option<&str>) -> Task {
        Task::new(
            PrincipalId::new("p1"),
            ModelKind::Demucs,
            Endpoint::VoiceIsolation,
            json!({}),
            webhook.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn test_terminal_task_is_delivered() {
        let notifier = RecordingNotifier::default();
        let mut t = task(Some("http://hook"));
        t.start().unwrap();
        t.succeed(vec!["u1".to_string()]).unwrap();

        notify_terminal(&notifier, &t).await;

        let deliveries = notifier.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "http://hook");
        assert_eq!(deliveries[0].1.status, TaskStatus::Succeeded);
        assert_eq!(deliveries[0].1.output, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_no_webhook_or_not_terminal_is_skipped() {
        let notifier = RecordingNotifier::default();
        notify_terminal(&notifier, &task(None)).await;
        notify_terminal(&notifier, &task(Some("http://hook"))).await;
        assert!(notifier.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let notifier = RecordingNotifier::failing();
        let mut t = task(Some("http://hook"));
        t.fail("boom").unwrap();
        notify_terminal(&notifier, &t).await;
        assert_eq!(notifier.deliveries().len(), 1);
    }

    #[test]
    fn test_payload_shape() {
        let mut t = task(None);
        t.fail("boom").unwrap();
        let json = serde_json::to_value(WebhookPayload::from(&t)).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["output"], json!([]));
    }
}
