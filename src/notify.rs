//! Notification dispatch. Notifications are fire-and-forget: the engine logs a
//! failed delivery and moves on.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A checklist run reached FAILED.
    RunFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::RunFailed => write!(f, "run_failed"),
        }
    }
}

/// Body posted to the webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub organization_id: String,
    pub context: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, kind: NotificationKind, organization_id: &str, context: &Value) -> Result<()>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, kind: NotificationKind, organization_id: &str, context: &Value) -> Result<()> {
        tracing::warn!(%kind, organization_id, %context, "notification");
        Ok(())
    }
}

/// Posts notifications as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: NotificationKind, organization_id: &str, context: &Value) -> Result<()> {
        let body = Notification {
            kind,
            organization_id: organization_id.to_string(),
            context: context.clone(),
        };
        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(EngineError::Notification(format!(
                "webhook returned {}: {message}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_notification_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/checkflow"))
            .and(body_partial_json(json!({
                "kind": "run_failed",
                "organization_id": "org-1",
                "context": {"reason": "StallError - stalled"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hooks/checkflow", server.uri())).unwrap();
        notifier
            .notify(
                NotificationKind::RunFailed,
                "org-1",
                &json!({"reason": "StallError - stalled"}),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri()).unwrap();
        let err = notifier
            .notify(NotificationKind::RunFailed, "org-1", &json!({}))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "notification: webhook returned 503: maintenance"
        );
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        assert!(LogNotifier
            .notify(NotificationKind::RunFailed, "org", &json!({"x": 1}))
            .await
            .is_ok());
    }

    #[test]
    fn kind_wire_name() {
        assert_eq!(serde_json::to_string(&NotificationKind::RunFailed).unwrap(), r#""run_failed""#);
        assert_eq!(NotificationKind::RunFailed.to_string(), "run_failed");
    }
}
