//! Holder for the MQTT client shared by every pipeline invocation.

use super::client::{MqttClientHandle, MqttClientOptions};
use std::sync::Arc;
use time::OffsetDateTime;

/// Reference to the shared holder plus the lock that guards it.
///
/// The lock must be held for the whole get-check-create-set sequence, so it
/// lives outside the holder.
pub type SharedMqttClient = Arc<tokio::sync::Mutex<SharedClientHolder>>;

pub struct SharedClientHolder {
    client: Option<MqttClientHandle>,
    secrets_last_retrieved: OffsetDateTime,
    client_options: Option<MqttClientOptions>,
}

impl Default for SharedClientHolder {
    fn default() -> Self {
        Self {
            client: None,
            secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            client_options: None,
        }
    }
}

impl SharedClientHolder {
    pub fn get(&self) -> (Option<MqttClientHandle>, OffsetDateTime) {
        (self.client.clone(), self.secrets_last_retrieved)
    }

    /// Swaps in a new client, disconnecting the previous one first if it is still connected.
    pub fn set(&mut self, client: Option<MqttClientHandle>, secrets_last_retrieved: OffsetDateTime) {
        if let Some(previous) = self.client.take() {
            let replaced = client
                .as_ref()
                .map(|next| Arc::ptr_eq(next, &previous))
                .unwrap_or(false);
            if !replaced && previous.is_connected() {
                previous.disconnect();
            }
        }
        self.client = client;
        self.secrets_last_retrieved = secrets_last_retrieved;
    }

    pub fn client_options(&self) -> Option<&MqttClientOptions> {
        self.client_options.as_ref()
    }

    pub fn set_client_options(&mut self, options: MqttClientOptions) {
        self.client_options = Some(options);
    }
}
