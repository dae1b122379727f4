use crate::configurable::{self, ExternalMqttConfig, Parameters};
use crate::error::ConfigError;
use crate::http::HTTP_EXPORT;
use crate::influxdb::INFLUXDB_SYNC_WRITE;
use crate::kafka::KAFKA_SEND;
use crate::mqtt::MQTT_EXPORT;
use crate::postgres::POSTGRES_WRITE;
use crate::sender::Sender;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub type SenderFactory =
    Arc<dyn Fn(&Parameters) -> Result<Box<dyn Sender>, ConfigError> + Send + Sync>;

/// Registry that resolves pipeline function names to sender factories.
pub struct SenderRegistry {
    factories: RwLock<HashMap<String, SenderFactory>>,
}

impl Default for SenderRegistry {
    fn default() -> Self {
        Self::with_builtin_senders(None)
    }
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding every built-in sender. `external_mqtt` backs the
    /// shared-client MQTT modes.
    pub fn with_builtin_senders(external_mqtt: Option<ExternalMqttConfig>) -> Self {
        let registry = Self::new();
        registry.register_builtin_senders(external_mqtt);
        registry
    }

    pub fn register(&self, function: impl Into<String>, factory: SenderFactory) {
        self.factories.write().insert(function.into(), factory);
    }

    pub fn is_registered(&self, function: &str) -> bool {
        self.factories.read().contains_key(function)
    }

    pub fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn instantiate(
        &self,
        function: &str,
        params: &Parameters,
    ) -> Result<Box<dyn Sender>, ConfigError> {
        let factory = {
            let guard = self.factories.read();
            guard.get(function).cloned().ok_or_else(|| {
                ConfigError::Invalid(format!("function `{function}` not registered"))
            })?
        };
        factory(params)
    }

    fn register_builtin_senders(&self, external_mqtt: Option<ExternalMqttConfig>) {
        self.register(
            MQTT_EXPORT,
            Arc::new(move |params| configurable::mqtt_export(params, external_mqtt.as_ref())),
        );
        self.register(
            HTTP_EXPORT,
            Arc::new(|params| Ok(Box::new(configurable::http_export(params)?))),
        );
        self.register(
            KAFKA_SEND,
            Arc::new(|params| Ok(Box::new(configurable::kafka_send(params)?))),
        );
        self.register(
            INFLUXDB_SYNC_WRITE,
            Arc::new(|params| Ok(Box::new(configurable::influxdb_sync_write(params)?))),
        );
        self.register(
            POSTGRES_WRITE,
            Arc::new(|params| Ok(Box::new(configurable::postgres_write(params)?))),
        );
    }
}
