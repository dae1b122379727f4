//! Operational notifications raised by senders.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub const CATEGORY_DISCONNECT_ALERT: &str = "DisconnectAlert";
pub const SEVERITY_CRITICAL: &str = "CRITICAL";
pub const CONTENT_TYPE_JSON: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub category: String,
    pub content: String,
    pub content_type: String,
    pub labels: Vec<String>,
    pub sender: String,
    pub severity: String,
}

#[derive(thiserror::Error, Debug)]
pub enum NotificationError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification service returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send_notification(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Posts notifications to the support-notifications REST API.
pub struct HttpNotificationClient {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpNotificationClient {
    pub fn new(base_url: &str) -> Result<Self, NotificationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            endpoint: format!("{}/api/v3/notification", base_url.trim_end_matches('/')),
            http,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddNotificationRequest<'a> {
    api_version: &'static str,
    notification: &'a Notification,
}

#[async_trait]
impl NotificationClient for HttpNotificationClient {
    async fn send_notification(&self, notification: Notification) -> Result<(), NotificationError> {
        let body = [AddNotificationRequest {
            api_version: "v3",
            notification: &notification,
        }];
        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Status(status.as_u16()));
        }
        Ok(())
    }
}
