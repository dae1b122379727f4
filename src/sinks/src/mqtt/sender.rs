//! MQTT export stages built on [`BaseMqttSender`].

use super::base::{BaseMqttSender, PublishSettings};
use super::factory::MqttClientFactory;
use crate::context::{AppFunctionContext, RECEIVED_TOPIC};
use crate::data::PipelineData;
use crate::error::{ConfigError, SenderError};
use crate::sender::{coerce, require_data, Sender};
use async_trait::async_trait;
use rumqttc::QoS;
use serde_json::{json, Value};
use std::sync::Arc;

pub const MQTT_EXPORT: &str = "XpertMQTTExport";

/// Plain publish of the stage input. Used for generic brokers and IBM Watson.
pub struct MqttSender {
    base: BaseMqttSender,
}

impl MqttSender {
    pub fn new(factory: Arc<dyn MqttClientFactory>, settings: PublishSettings) -> Self {
        Self {
            base: BaseMqttSender::new(factory, settings),
        }
    }

    pub fn base(&self) -> &BaseMqttSender {
        &self.base
    }
}

#[async_trait]
impl Sender for MqttSender {
    fn name(&self) -> &str {
        MQTT_EXPORT
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        let payload = coerce(self.name(), &data)?;
        self.base.publish(ctx, payload, None).await?;
        Ok(data)
    }
}

/// Error result passed down the pipeline, as `{"code": <status>, "error": <message>}`.
fn error_result(value: &Value) -> Option<(u16, String)> {
    let code = value.get("code")?.as_u64()?;
    let message = value.get("error")?.as_str()?;
    let code = u16::try_from(code).ok()?;
    Some((code, message.to_string()))
}

fn input_error_result(data: &PipelineData) -> Option<(u16, String)> {
    match data {
        PipelineData::Json(value) => error_result(value),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsExportMode {
    Publish,
    /// Wraps the input in a `{Status, ResponseBody}` envelope.
    Response,
}

/// AWS IoT Core export. QoS 2 and retained messages are not supported by the service.
pub struct AwsIotCoreSender {
    base: BaseMqttSender,
    mode: AwsExportMode,
}

impl AwsIotCoreSender {
    pub fn new(
        factory: Arc<dyn MqttClientFactory>,
        mut settings: PublishSettings,
        mode: AwsExportMode,
    ) -> Result<Self, ConfigError> {
        if settings.qos == QoS::ExactlyOnce {
            return Err(ConfigError::Invalid(
                "AWS IoT doesn't support QoS: 2".to_string(),
            ));
        }
        settings.retain = false;
        Ok(Self {
            base: BaseMqttSender::new(factory, settings),
            mode,
        })
    }

    pub fn base(&self) -> &BaseMqttSender {
        &self.base
    }

    async fn publish_value(
        &self,
        ctx: &dyn AppFunctionContext,
        value: &Value,
    ) -> Result<(), SenderError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            SenderError::UnsupportedData(format!("failed to marshal data to JSON: {err}"))
        })?;
        self.base.publish(ctx, payload, None).await
    }

    async fn publish_raw(
        &self,
        ctx: &dyn AppFunctionContext,
        raw: &[u8],
    ) -> Result<(), SenderError> {
        let parsed: Value = serde_json::from_slice(raw)
            .map_err(|_| SenderError::UnsupportedData("unsupported data type".to_string()))?;
        match parsed {
            Value::Array(items) => self.publish_items(ctx, items).await,
            Value::Object(_) => self.base.publish(ctx, raw.to_vec(), None).await,
            _ => Err(SenderError::UnsupportedData(
                "unsupported data type".to_string(),
            )),
        }
    }

    /// Publishes every element separately and stages the failures as one array.
    async fn publish_items(
        &self,
        ctx: &dyn AppFunctionContext,
        items: Vec<Value>,
    ) -> Result<(), SenderError> {
        let total = items.len();
        let mut failed = Vec::new();
        let mut last_error = None;
        for item in items {
            if let Err(err) = self.publish_value(ctx, &item).await {
                if !err.is_retryable() {
                    if !failed.is_empty() {
                        self.stage_items(ctx, &failed)?;
                    }
                    return Err(err);
                }
                last_error = Some(err);
                failed.push(item);
            }
        }
        let Some(last_error) = last_error else {
            return Ok(());
        };

        self.stage_items(ctx, &failed)?;
        Err(SenderError::Transport(format!(
            "failed to publish {} of {} items to AWS IoT Core ({}), {}",
            failed.len(),
            total,
            last_error,
            if self.base.settings().persist_on_error {
                "persisting data for later retry"
            } else {
                "dropping data"
            }
        )))
    }

    /// Replaces whatever single item the base staged with the whole failed set.
    fn stage_items(&self, ctx: &dyn AppFunctionContext, failed: &[Value]) -> Result<(), SenderError> {
        if self.base.settings().persist_on_error {
            let staged = serde_json::to_vec(failed).map_err(|err| {
                SenderError::Other(format!("failed to marshal retry data: {err}"))
            })?;
            ctx.set_retry_data(staged);
        }
        Ok(())
    }

    async fn send_publish(
        &self,
        ctx: &dyn AppFunctionContext,
        data: &PipelineData,
    ) -> Result<(), SenderError> {
        match data {
            PipelineData::Bytes(raw) => self.publish_raw(ctx, raw).await,
            PipelineData::Text(text) => self.publish_raw(ctx, text.as_bytes()).await,
            other => {
                let value = other.to_json().map_err(|err| {
                    SenderError::UnsupportedData(format!("failed to marshal data to JSON: {err}"))
                })?;
                // Batches go out item by item so a resend of the staged array matches.
                match value {
                    Value::Array(items) => self.publish_items(ctx, items).await,
                    value => self.publish_value(ctx, &value).await,
                }
            }
        }
    }

    async fn send_response(
        &self,
        ctx: &dyn AppFunctionContext,
        data: &PipelineData,
    ) -> Result<(), SenderError> {
        let envelope = match input_error_result(data) {
            Some((status, message)) => json!({
                "Status": status,
                "ResponseBody": { "error": message },
            }),
            None => {
                let body = data.to_json().map_err(|err| {
                    SenderError::UnsupportedData(format!("failed to marshal data to JSON: {err}"))
                })?;
                json!({ "Status": 200, "ResponseBody": body })
            }
        };
        self.publish_value(ctx, &envelope).await
    }
}

#[async_trait]
impl Sender for AwsIotCoreSender {
    fn name(&self) -> &str {
        MQTT_EXPORT
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        match self.mode {
            AwsExportMode::Publish => self.send_publish(ctx, &data).await?,
            AwsExportMode::Response => self.send_response(ctx, &data).await?,
        }
        Ok(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AzureExportMode {
    Publish,
    /// Replies to a direct method invocation received on `receivedtopic`.
    DirectMethodResponse,
}

/// Azure IoT Hub export.
pub struct AzureIotHubSender {
    base: BaseMqttSender,
    mode: AzureExportMode,
}

impl AzureIotHubSender {
    pub fn new(
        factory: Arc<dyn MqttClientFactory>,
        settings: PublishSettings,
        mode: AzureExportMode,
    ) -> Self {
        Self {
            base: BaseMqttSender::new(factory, settings),
            mode,
        }
    }

    pub fn base(&self) -> &BaseMqttSender {
        &self.base
    }

    async fn send_direct_method_response(
        &self,
        ctx: &dyn AppFunctionContext,
        data: &PipelineData,
    ) -> Result<(), SenderError> {
        let received_topic = ctx.get_value(RECEIVED_TOPIC).ok_or_else(|| {
            SenderError::Other("received topic was not found in AppFunctionContext".to_string())
        })?;
        let request_id = direct_method_request_id(&received_topic).ok_or_else(|| {
            SenderError::Other(format!(
                "request id was not found in received topic `{received_topic}`"
            ))
        })?;

        let (status, payload) = match input_error_result(data) {
            Some((status, message)) => {
                let body = serde_json::to_vec(&json!({ "error": message })).map_err(|err| {
                    SenderError::Other(format!("failed to marshal error response: {err}"))
                })?;
                (status, body)
            }
            None => (200, coerce(self.name(), data)?),
        };
        let topic = direct_method_response_topic(status, request_id);
        self.base.publish(ctx, payload, Some(&topic)).await
    }
}

/// Request id following the last `?$rid=` of a direct method topic.
pub fn direct_method_request_id(received_topic: &str) -> Option<&str> {
    let (_, rid) = received_topic.rsplit_once("?$rid=")?;
    (!rid.is_empty()).then_some(rid)
}

pub fn direct_method_response_topic(status: u16, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

#[async_trait]
impl Sender for AzureIotHubSender {
    fn name(&self) -> &str {
        MQTT_EXPORT
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        match self.mode {
            AzureExportMode::Publish => {
                let payload = coerce(self.name(), &data)?;
                self.base.publish(ctx, payload, None).await?;
            }
            AzureExportMode::DirectMethodResponse => {
                self.send_direct_method_response(ctx, &data).await?
            }
        }
        Ok(data)
    }
}
