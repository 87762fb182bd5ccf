//! CI/CD webhook client.
//!
//! Posts a JSON notification when a change request enters execution.
//! Delivery is best-effort: callers use [`WebhookNotifier::dispatch`], which
//! runs detached and only logs failures.

use crate::error::AppError;
use crate::models::ChangeRequest;
use reqwest::{header, Client};
use serde::Serialize;
use std::time::Duration;

/// Webhook client configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint receiving the POST. Empty disables notifications.
    pub url: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 10,
        }
    }
}

impl WebhookConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// JSON body sent to the CI/CD endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub cr_id: i64,
    pub title: String,
    pub config_changes: String,
    pub approval_status: String,
    pub execution_status: String,
    pub requester_user_id: i64,
    pub requester_team_id: i64,
    /// Unix time the notification was built.
    pub timestamp: i64,
}

impl WebhookPayload {
    pub fn from_change_request(cr: &ChangeRequest, timestamp: i64) -> Self {
        Self {
            cr_id: cr.cr_id,
            title: cr.title.clone(),
            config_changes: cr.config_changes_payload.clone(),
            approval_status: cr.approval_status.clone(),
            execution_status: cr.execution_status.clone(),
            requester_user_id: cr.requester_user_id,
            requester_team_id: cr.requester_team_id,
            timestamp,
        }
    }
}

/// HTTP client for the CI/CD webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    /// Create a notifier, or `None` when no URL is configured.
    pub fn new(config: WebhookConfig) -> Result<Option<Self>, AppError> {
        if !config.is_enabled() {
            return Ok(None);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_static(concat!("gateway-cr/", env!("CARGO_PKG_VERSION"))),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Some(Self { client, config }))
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Send one notification and report the outcome.
    ///
    /// Non-2xx responses are errors.
    pub async fn notify(&self, payload: &WebhookPayload) -> Result<(), AppError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AppError::internal(format!(
                "Webhook returned status {}: {}",
                status.as_u16(),
                body
            )))
        }
    }

    /// Send a notification on a detached task; failures are logged and dropped.
    pub fn dispatch(&self, payload: WebhookPayload) -> tokio::task::JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            match notifier.notify(&payload).await {
                Ok(()) => log::info!("[webhook] Sent notification for CR {}", payload.cr_id),
                Err(e) => log::warn!(
                    "[webhook] Delivery failed for CR {} to {}: {}",
                    payload.cr_id,
                    notifier.url(),
                    e
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    fn sample_cr() -> ChangeRequest {
        ChangeRequest {
            cr_id: 42,
            requester_user_id: 7,
            requester_team_id: 3,
            title: "bump timeout".to_string(),
            config_changes_payload: r#"{"timeout":30}"#.to_string(),
            created_at: 0,
            approval_status: "APPROVED".to_string(),
            execution_status: "IN_PROGRESS".to_string(),
        }
    }

    async fn spawn_receiver(status: StatusCode) -> (String, tokio::sync::mpsc::Receiver<serde_json::Value>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let app = Router::new().route(
            "/hook",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body).await;
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), rx)
    }

    #[test]
    fn test_empty_url_disables_notifier() {
        let notifier = WebhookNotifier::new(WebhookConfig::default()).unwrap();
        assert!(notifier.is_none());

        let notifier = WebhookNotifier::new(WebhookConfig {
            url: "   ".to_string(),
            timeout_secs: 1,
        })
        .unwrap();
        assert!(notifier.is_none());
    }

    #[test]
    fn test_payload_fields() {
        let payload = WebhookPayload::from_change_request(&sample_cr(), 1_700_000_000);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["cr_id"], 42);
        assert_eq!(json["config_changes"], r#"{"timeout":30}"#);
        assert_eq!(json["approval_status"], "APPROVED");
        assert_eq!(json["execution_status"], "IN_PROGRESS");
        assert_eq!(json["requester_user_id"], 7);
        assert_eq!(json["requester_team_id"], 3);
        assert_eq!(json["timestamp"], 1_700_000_000i64);
    }

    #[tokio::test]
    async fn test_notify_posts_json() {
        let (url, mut rx) = spawn_receiver(StatusCode::OK).await;
        let notifier = WebhookNotifier::new(WebhookConfig { url, timeout_secs: 5 })
            .unwrap()
            .unwrap();

        notifier
            .notify(&WebhookPayload::from_change_request(&sample_cr(), 1))
            .await
            .unwrap();

        let body = rx.recv().await.unwrap();
        assert_eq!(body["title"], "bump timeout");
    }

    #[tokio::test]
    async fn test_notify_reports_non_success_status() {
        let (url, _rx) = spawn_receiver(StatusCode::BAD_GATEWAY).await;
        let notifier = WebhookNotifier::new(WebhookConfig { url, timeout_secs: 5 })
            .unwrap()
            .unwrap();

        let err = notifier
            .notify(&WebhookPayload::from_change_request(&sample_cr(), 1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn test_dispatch_swallows_connection_errors() {
        // Nothing listens on port 9 on loopback
        let notifier = WebhookNotifier::new(WebhookConfig {
            url: "http://127.0.0.1:9/hook".to_string(),
            timeout_secs: 1,
        })
        .unwrap()
        .unwrap();

        let handle = notifier.dispatch(WebhookPayload::from_change_request(&sample_cr(), 1));
        // The task completes without panicking even though delivery failed
        handle.await.unwrap();
    }
}
