//! Lifecycle shared by every MQTT export variant.
//!
//! A sender starts without a client. The first publish builds one through its
//! [`MqttClientFactory`]; the client is rebuilt whenever the context reports a
//! secret rotation newer than the moment the client was built. Construction
//! happens under a lock and the staleness check is repeated after the lock is
//! acquired, so at most one factory call runs per rotation.

use super::client::{map_qos, MqttClientError, MqttClientHandle};
use super::factory::MqttClientFactory;
use crate::context::AppFunctionContext;
use crate::counter::BoundedCounter;
use crate::error::{ConfigError, SenderError};
use rumqttc::QoS;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Upper bound for a connect or publish round trip.
pub const WAIT_DURATION: Duration = Duration::from_secs(10);

pub const MQTT_EXPORT_SIZE: &str = "MqttExportSize";

/// Publishing parameters resolved at construction time.
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub broker_address: String,
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub persist_on_error: bool,
    pub use_shared_client: bool,
}

impl PublishSettings {
    pub fn new(
        broker_address: impl Into<String>,
        topic: impl Into<String>,
        qos: u8,
    ) -> Result<Self, ConfigError> {
        let qos = map_qos(qos).map_err(ConfigError::Invalid)?;
        Ok(Self {
            broker_address: broker_address.into(),
            topic: topic.into(),
            qos,
            retain: false,
            persist_on_error: false,
            use_shared_client: false,
        })
    }
}

struct SenderState {
    client: Option<MqttClientHandle>,
    secrets_last_retrieved: OffsetDateTime,
}

fn is_stale(
    client: &Option<MqttClientHandle>,
    secrets_last_retrieved: OffsetDateTime,
    ctx: &dyn AppFunctionContext,
) -> bool {
    client.is_none() || secrets_last_retrieved < ctx.secrets_last_updated()
}

/// Releases one waiter slot when dropped.
struct WaiterSlot(Arc<BoundedCounter>);

impl WaiterSlot {
    fn acquire(counter: Arc<BoundedCounter>) -> Result<Self, SenderError> {
        counter.add(1).map_err(|err| {
            SenderError::Connection(format!(
                "too many pending MQTT connection attempts ({err}), try again later"
            ))
        })?;
        Ok(Self(counter))
    }
}

impl Drop for WaiterSlot {
    fn drop(&mut self) {
        self.0.subtract(1);
    }
}

pub struct BaseMqttSender {
    factory: Arc<dyn MqttClientFactory>,
    settings: PublishSettings,
    state: tokio::sync::Mutex<SenderState>,
}

impl BaseMqttSender {
    pub fn new(factory: Arc<dyn MqttClientFactory>, settings: PublishSettings) -> Self {
        Self {
            factory,
            settings,
            state: tokio::sync::Mutex::new(SenderState {
                client: None,
                secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            }),
        }
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Returns a usable client, building one when absent or stale.
    async fn initialize(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        if self.settings.use_shared_client {
            let shared = ctx.shared_mqtt_client();
            let mut holder = shared.lock().await;
            let (client, secrets_last_retrieved) = holder.get();
            if !is_stale(&client, secrets_last_retrieved, ctx) {
                if let Some(client) = client {
                    return Ok(client);
                }
            }
            let client = self.build_client(ctx).await?;
            holder.set(Some(Arc::clone(&client)), OffsetDateTime::now_utc());
            holder.set_client_options(client.options().clone());
            return Ok(client);
        }

        let mut state = self.state.lock().await;
        if !is_stale(&state.client, state.secrets_last_retrieved, ctx) {
            if let Some(client) = state.client.as_ref() {
                return Ok(Arc::clone(client));
            }
        }
        let client = self.build_client(ctx).await?;
        if let Some(previous) = state.client.replace(Arc::clone(&client)) {
            if previous.is_connected() {
                previous.disconnect();
            }
        }
        state.secrets_last_retrieved = OffsetDateTime::now_utc();
        Ok(client)
    }

    async fn build_client(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        tracing::debug!(
            pipeline_id = ctx.pipeline_id(),
            broker = %self.settings.broker_address,
            shared = self.settings.use_shared_client,
            "initializing MQTT client"
        );
        self.factory.create(ctx).await.map_err(|err| {
            tracing::error!(
                pipeline_id = ctx.pipeline_id(),
                correlation_id = ctx.correlation_id(),
                broker = %self.settings.broker_address,
                error = %err,
                "failed to initialize MQTT client"
            );
            err
        })
    }

    async fn connect(
        &self,
        ctx: &dyn AppFunctionContext,
        client: &MqttClientHandle,
    ) -> Result<(), SenderError> {
        let _slot = WaiterSlot::acquire(ctx.mqtt_connection_waiting_counter())?;

        let shared = ctx.shared_mqtt_client();
        let _shared_guard;
        let _state_guard;
        if self.settings.use_shared_client {
            _shared_guard = shared.lock().await;
        } else {
            _state_guard = self.state.lock().await;
        }

        if client.is_connected() {
            return Ok(());
        }

        let address = &self.settings.broker_address;
        tracing::info!(
            pipeline_id = ctx.pipeline_id(),
            broker = %address,
            "connecting to MQTT broker"
        );
        match client.connect(WAIT_DURATION).await {
            Ok(()) => {
                tracing::info!(pipeline_id = ctx.pipeline_id(), broker = %address, "connected to MQTT broker");
                Ok(())
            }
            Err(MqttClientError::Timeout) => Err(SenderError::Timeout(format!(
                "connection timeout while connecting to MQTT Broker: {address}"
            ))),
            Err(err) => Err(SenderError::Connection(format!(
                "could not connect to MQTT Broker: {address}. Error: {err}"
            ))),
        }
    }

    /// Publishes `payload` to the configured topic, or to `topic_override` when given.
    pub async fn publish(
        &self,
        ctx: &dyn AppFunctionContext,
        payload: Vec<u8>,
        topic_override: Option<&str>,
    ) -> Result<(), SenderError> {
        let client = self.initialize(ctx).await?;

        if !client.is_connected() {
            if let Err(err) = self.connect(ctx, &client).await {
                self.set_retry_data(ctx, &payload);
                tracing::error!(
                    pipeline_id = ctx.pipeline_id(),
                    correlation_id = ctx.correlation_id(),
                    error = %err,
                    "failed to connect to MQTT broker, {}",
                    self.failure_action()
                );
                return Err(err);
            }
        }

        let topic = match topic_override {
            Some(topic) => topic.to_string(),
            None => ctx.apply_values(&self.settings.topic)?,
        };

        let address = &self.settings.broker_address;
        let size = payload.len();
        let outcome = client
            .publish(
                &topic,
                self.settings.qos,
                self.settings.retain,
                payload.clone(),
                WAIT_DURATION,
            )
            .await;
        if let Err(err) = outcome {
            self.set_retry_data(ctx, &payload);
            let err = match err {
                MqttClientError::Timeout => SenderError::Timeout(format!(
                    "connection timeout while publishing to MQTT Broker: {address}"
                )),
                other => SenderError::Transport(format!(
                    "failed to publish data to MQTT Broker: {address}. Error: {other}"
                )),
            };
            tracing::error!(
                pipeline_id = ctx.pipeline_id(),
                correlation_id = ctx.correlation_id(),
                broker = %address,
                topic = %topic,
                error = %err,
                "MQTT publish failed, {}",
                self.failure_action()
            );
            return Err(err);
        }

        tracing::debug!(
            pipeline_id = ctx.pipeline_id(),
            correlation_id = ctx.correlation_id(),
            broker = %address,
            topic = %topic,
            bytes = size,
            "sent data to MQTT broker"
        );
        self.record_export_size(ctx, size);
        Ok(())
    }

    pub fn set_retry_data(&self, ctx: &dyn AppFunctionContext, payload: &[u8]) {
        if self.settings.persist_on_error {
            ctx.set_retry_data(payload.to_vec());
        }
    }

    pub fn failure_action(&self) -> &'static str {
        if self.settings.persist_on_error {
            "persisting Event for later retry"
        } else {
            "dropping event"
        }
    }

    /// Keyed by the configured topic so templated topics share one series.
    fn record_export_size(&self, ctx: &dyn AppFunctionContext, size: usize) {
        let Some(metrics) = ctx.metrics_manager() else {
            return;
        };
        let mut tags = BTreeMap::new();
        tags.insert(
            "destination".to_string(),
            format!("{}/{}", self.settings.broker_address, self.settings.topic),
        );
        match metrics.histogram(MQTT_EXPORT_SIZE, "Size in bytes of data exported over MQTT", &tags) {
            Ok(histogram) => histogram.observe(size as f64),
            Err(err) => tracing::warn!(
                metric = MQTT_EXPORT_SIZE,
                error = %err,
                "Unable to register metric, collection will not be reported"
            ),
        }
    }
}
