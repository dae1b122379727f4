use crate::configurable::parse_bool;
use crate::context::{AppFunctionContext, POST_DISCONNECTION_ALERT, SERVICE_KEY};
use crate::notification::{
    Notification, NotificationClient, CATEGORY_DISCONNECT_ALERT, CONTENT_TYPE_JSON,
    SEVERITY_CRITICAL,
};
use serde::Serialize;
use std::sync::Arc;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionLostContent<'a> {
    servers: &'a [String],
    client_id: &'a str,
    error: &'a str,
    time: String,
}

/// Invoked by the client event loop when an established connection drops.
///
/// Context values are captured when the client is built since the invocation
/// context is gone by the time the connection is lost.
#[derive(Clone)]
pub struct ConnectionLostHandler {
    post_alert: bool,
    service_key: String,
    notifications: Option<Arc<dyn NotificationClient>>,
}

impl ConnectionLostHandler {
    pub fn from_context(ctx: &dyn AppFunctionContext) -> Self {
        let post_alert = match ctx.get_value(POST_DISCONNECTION_ALERT) {
            None => false,
            Some(raw) => match parse_bool(&raw) {
                Some(flag) => flag,
                None => {
                    tracing::warn!(
                        value = %raw,
                        "invalid {} context value, defaulting to false",
                        POST_DISCONNECTION_ALERT
                    );
                    false
                }
            },
        };
        Self {
            post_alert,
            service_key: ctx.get_value(SERVICE_KEY).unwrap_or_default(),
            notifications: ctx.notification_client(),
        }
    }

    pub fn post_alert(&self) -> bool {
        self.post_alert
    }

    pub fn handle(&self, servers: &[String], client_id: &str, error: &str) {
        let content = ConnectionLostContent {
            servers,
            client_id,
            error,
            time: OffsetDateTime::now_utc()
                .format(&Rfc2822)
                .unwrap_or_default(),
        };
        let content = match serde_json::to_string(&content) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode MQTT connection lost details");
                return;
            }
        };
        tracing::error!("MQTT connection lost: {}", content);

        if !self.post_alert {
            return;
        }
        let Some(client) = self.notifications.clone() else {
            tracing::error!("notification client is not configured, unable to post disconnection alert");
            return;
        };
        let notification = Notification {
            category: CATEGORY_DISCONNECT_ALERT.to_string(),
            content,
            content_type: CONTENT_TYPE_JSON.to_string(),
            labels: vec!["MQTT".to_string()],
            sender: self.service_key.clone(),
            severity: SEVERITY_CRITICAL.to_string(),
        };
        tokio::spawn(async move {
            if let Err(err) = client.send_notification(notification).await {
                tracing::error!(error = %err, "failed to send MQTT disconnection alert");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceResources;
    use crate::notification::NotificationError;
    use crate::secrets::InMemorySecretProvider;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationClient for RecordingNotifier {
        async fn send_notification(
            &self,
            notification: Notification,
        ) -> Result<(), NotificationError> {
            self.sent.lock().push(notification);
            Ok(())
        }
    }

    #[tokio::test]
    async fn posts_alert_when_enabled() {
        let notifier = Arc::new(RecordingNotifier::default());
        let resources = ServiceResources::new(Arc::new(InMemorySecretProvider::new()))
            .with_notification_client(notifier.clone());
        let ctx = resources.context("p1");
        ctx.add_value(POST_DISCONNECTION_ALERT, "true");
        ctx.add_value(SERVICE_KEY, "app-mqtt-export");

        let handler = ConnectionLostHandler::from_context(&ctx);
        handler.handle(&["tcp://broker:1883".to_string()], "edge-1", "connection reset");

        for _ in 0..50 {
            if !notifier.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].category, CATEGORY_DISCONNECT_ALERT);
        assert_eq!(sent[0].sender, "app-mqtt-export");
        assert_eq!(sent[0].severity, SEVERITY_CRITICAL);
        assert_eq!(sent[0].labels, vec!["MQTT".to_string()]);
        let content: serde_json::Value = serde_json::from_str(&sent[0].content).unwrap();
        assert_eq!(content["clientId"], "edge-1");
        assert_eq!(content["error"], "connection reset");
    }

    #[test]
    fn invalid_alert_flag_defaults_to_false() {
        let ctx = ServiceResources::new(Arc::new(InMemorySecretProvider::new())).context("p1");
        ctx.add_value(POST_DISCONNECTION_ALERT, "maybe");
        assert!(!ConnectionLostHandler::from_context(&ctx).post_alert());
        ctx.add_value(POST_DISCONNECTION_ALERT, "T");
        assert!(ConnectionLostHandler::from_context(&ctx).post_alert());
    }
}
