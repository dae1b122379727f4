//! Per-invocation context handed to every sender.

use crate::counter::BoundedCounter;
use crate::mqtt::shared::{SharedClientHolder, SharedMqttClient};
use crate::notification::NotificationClient;
use crate::secrets::{SecretData, SecretError, SecretProvider};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use telemetry::MetricsManager;
use time::OffsetDateTime;

/// Context value naming the topic an Azure direct method request arrived on.
pub const RECEIVED_TOPIC: &str = "receivedtopic";
/// Context value toggling a notification when the MQTT connection drops.
pub const POST_DISCONNECTION_ALERT: &str = "postdisconnectionalert";
/// Context value identifying the running service.
pub const SERVICE_KEY: &str = "servicekey";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to replace all context placeholders in input ('{0}' after replacements)")]
pub struct TemplateError(pub String);

/// Everything a sender may consume from its surroundings.
#[async_trait]
pub trait AppFunctionContext: Send + Sync {
    fn pipeline_id(&self) -> &str;

    fn correlation_id(&self) -> &str;

    async fn get_secret(&self, path: &str) -> Result<SecretData, SecretError>;

    fn secrets_last_updated(&self) -> OffsetDateTime;

    /// Stages `data` for store-and-forward resend.
    fn set_retry_data(&self, data: Vec<u8>);

    fn retry_data(&self) -> Option<Vec<u8>>;

    /// Substitutes `{key}` placeholders with context values.
    fn apply_values(&self, template: &str) -> Result<String, TemplateError>;

    fn get_value(&self, key: &str) -> Option<String>;

    fn add_value(&self, key: &str, value: &str);

    fn remove_value(&self, key: &str);

    fn metrics_manager(&self) -> Option<Arc<dyn MetricsManager>>;

    fn notification_client(&self) -> Option<Arc<dyn NotificationClient>>;

    /// Shared MQTT client holder together with its companion lock.
    fn shared_mqtt_client(&self) -> SharedMqttClient;

    fn mqtt_connection_waiting_counter(&self) -> Arc<BoundedCounter>;
}

/// Long-lived resources owned by the service and referenced by each context.
#[derive(Clone)]
pub struct ServiceResources {
    pub secrets: Arc<dyn SecretProvider>,
    pub metrics: Option<Arc<dyn MetricsManager>>,
    pub notifications: Option<Arc<dyn NotificationClient>>,
    pub shared_mqtt: SharedMqttClient,
    pub connection_waiters: Arc<BoundedCounter>,
}

impl ServiceResources {
    pub fn new(secrets: Arc<dyn SecretProvider>) -> Self {
        Self {
            secrets,
            metrics: None,
            notifications: None,
            shared_mqtt: Arc::new(tokio::sync::Mutex::new(SharedClientHolder::default())),
            connection_waiters: Arc::new(BoundedCounter::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsManager>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_notification_client(mut self, client: Arc<dyn NotificationClient>) -> Self {
        self.notifications = Some(client);
        self
    }

    pub fn with_connection_waiters(mut self, maximum: u32) -> Self {
        self.connection_waiters = Arc::new(BoundedCounter::new(maximum, 0));
        self
    }

    /// Context for a single pipeline invocation.
    pub fn context(&self, pipeline_id: impl Into<String>) -> AppContext {
        AppContext::new(pipeline_id, self.clone())
    }
}

/// Default [`AppFunctionContext`] implementation.
pub struct AppContext {
    pipeline_id: String,
    correlation_id: String,
    values: RwLock<HashMap<String, String>>,
    retry_data: Mutex<Option<Vec<u8>>>,
    resources: ServiceResources,
}

impl AppContext {
    pub fn new(pipeline_id: impl Into<String>, resources: ServiceResources) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            values: RwLock::new(HashMap::new()),
            retry_data: Mutex::new(None),
            resources,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[async_trait]
impl AppFunctionContext for AppContext {
    fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    async fn get_secret(&self, path: &str) -> Result<SecretData, SecretError> {
        self.resources.secrets.get_secret(path).await
    }

    fn secrets_last_updated(&self) -> OffsetDateTime {
        self.resources.secrets.secrets_last_updated()
    }

    fn set_retry_data(&self, data: Vec<u8>) {
        *self.retry_data.lock() = Some(data);
    }

    fn retry_data(&self) -> Option<Vec<u8>> {
        self.retry_data.lock().clone()
    }

    fn apply_values(&self, template: &str) -> Result<String, TemplateError> {
        let values = self.values.read();
        apply_placeholders(template, |key| values.get(&key.to_lowercase()).cloned())
    }

    fn get_value(&self, key: &str) -> Option<String> {
        self.values.read().get(&key.to_lowercase()).cloned()
    }

    fn add_value(&self, key: &str, value: &str) {
        self.values
            .write()
            .insert(key.to_lowercase(), value.to_string());
    }

    fn remove_value(&self, key: &str) {
        self.values.write().remove(&key.to_lowercase());
    }

    fn metrics_manager(&self) -> Option<Arc<dyn MetricsManager>> {
        self.resources.metrics.clone()
    }

    fn notification_client(&self) -> Option<Arc<dyn NotificationClient>> {
        self.resources.notifications.clone()
    }

    fn shared_mqtt_client(&self) -> SharedMqttClient {
        Arc::clone(&self.resources.shared_mqtt)
    }

    fn mqtt_connection_waiting_counter(&self) -> Arc<BoundedCounter> {
        Arc::clone(&self.resources.connection_waiters)
    }
}

/// Replaces every `{key}` in `template` using `lookup`.
///
/// Braces that do not enclose a plain key are copied through. A key with no
/// value leaves the placeholder in place, which fails the whole substitution.
pub fn apply_placeholders<F>(template: &str, lookup: F) -> Result<String, TemplateError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut unresolved = false;
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(['{', '}']) {
            Some(end) if after.as_bytes()[end] == b'}' && end > 0 => {
                let key = &after[..end];
                match lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        unresolved = true;
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);

    if unresolved {
        return Err(TemplateError(out));
    }
    Ok(out)
}
