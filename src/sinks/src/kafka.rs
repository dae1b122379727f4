//! Kafka export through an rdkafka `FutureProducer`.

use crate::context::AppFunctionContext;
use crate::data::PipelineData;
use crate::error::{ConfigError, SenderError};
use crate::secrets::{non_empty, SecretData};
use crate::sender::{coerce, require_data, Sender};
use crate::tls::parse_certificates;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub const KAFKA_SEND: &str = "KafkaSend";

pub const SECRET_CLIENT_KEY: &str = "clientkey";
pub const SECRET_CLIENT_CERT: &str = "clientcert";
pub const SECRET_CA_CERT: &str = "cacert";
pub const SECRET_DECRYPTED_PASSWORD: &str = "decryptedpassword";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KafkaAuthMode {
    #[default]
    None,
    ClientCert,
}

impl KafkaAuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "clientcert" => Some(Self::ClientCert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaEndpoint {
    pub client_id: String,
    pub address: String,
    pub port: u16,
    pub topic: String,
    pub partition: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KafkaSecretsConfig {
    pub auth_mode: KafkaAuthMode,
    pub secret_path: String,
    pub skip_verify: bool,
}

/// Producer settings for `endpoint`, with TLS material from `secrets` when
/// client-certificate auth is selected.
pub fn producer_config(
    endpoint: &KafkaEndpoint,
    auth: &KafkaSecretsConfig,
    secrets: &SecretData,
) -> Result<ClientConfig, SenderError> {
    let mut config = ClientConfig::new();
    config
        .set(
            "bootstrap.servers",
            format!("{}:{}", endpoint.address, endpoint.port),
        )
        .set("client.id", &endpoint.client_id)
        .set("acks", "all")
        .set("message.timeout.ms", DELIVERY_TIMEOUT.as_millis().to_string());

    if auth.auth_mode == KafkaAuthMode::ClientCert {
        let (Some(key), Some(cert)) = (
            non_empty(secrets, SECRET_CLIENT_KEY),
            non_empty(secrets, SECRET_CLIENT_CERT),
        ) else {
            return Err(SenderError::Credentials(
                "clientcert authentication mode selected however the key or cert PEM block was not found at secret path"
                    .to_string(),
            ));
        };
        config
            .set("security.protocol", "ssl")
            .set("ssl.key.pem", key)
            .set("ssl.certificate.pem", cert);
        if let Some(ca) = non_empty(secrets, SECRET_CA_CERT) {
            parse_certificates("cacert", ca).map_err(|err| {
                SenderError::Credentials(format!("error parsing CA Certificate: {err}"))
            })?;
            config.set("ssl.ca.pem", ca);
        }
        if let Some(password) = non_empty(secrets, SECRET_DECRYPTED_PASSWORD) {
            config.set("ssl.key.password", password);
        }
        if auth.skip_verify {
            config.set("enable.ssl.certificate.verification", "false");
        }
    }
    Ok(config)
}

struct ProducerState {
    producer: Option<Arc<FutureProducer>>,
    secrets_last_retrieved: OffsetDateTime,
}

pub struct KafkaSender {
    endpoint: KafkaEndpoint,
    secrets_config: KafkaSecretsConfig,
    persist_on_error: bool,
    state: tokio::sync::Mutex<ProducerState>,
}

impl KafkaSender {
    pub fn new(
        endpoint: KafkaEndpoint,
        secrets_config: KafkaSecretsConfig,
        persist_on_error: bool,
    ) -> Result<Self, ConfigError> {
        if secrets_config.auth_mode == KafkaAuthMode::ClientCert
            && secrets_config.secret_path.trim().is_empty()
        {
            return Err(ConfigError::Missing("secretpath".to_string()));
        }
        Ok(Self {
            endpoint,
            secrets_config,
            persist_on_error,
            state: tokio::sync::Mutex::new(ProducerState {
                producer: None,
                secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            }),
        })
    }

    pub fn endpoint(&self) -> &KafkaEndpoint {
        &self.endpoint
    }

    async fn producer(&self, ctx: &dyn AppFunctionContext) -> Result<Arc<FutureProducer>, SenderError> {
        let mut state = self.state.lock().await;
        if state.secrets_last_retrieved >= ctx.secrets_last_updated() {
            if let Some(producer) = state.producer.as_ref() {
                return Ok(Arc::clone(producer));
            }
        }

        let secrets = match self.secrets_config.auth_mode {
            KafkaAuthMode::None => SecretData::new(),
            KafkaAuthMode::ClientCert => ctx.get_secret(&self.secrets_config.secret_path).await?,
        };
        let server = format!("{}:{}", self.endpoint.address, self.endpoint.port);
        tracing::info!(endpoint = %server, "creating Kafka producer");
        let producer: FutureProducer = producer_config(&self.endpoint, &self.secrets_config, &secrets)?
            .create()
            .map_err(|err| {
                SenderError::Connection(format!(
                    "could not create Kafka producer, {server}. Error: {err}"
                ))
            })?;
        let producer = Arc::new(producer);
        state.producer = Some(Arc::clone(&producer));
        state.secrets_last_retrieved = OffsetDateTime::now_utc();
        Ok(producer)
    }
}

#[async_trait]
impl Sender for KafkaSender {
    fn name(&self) -> &str {
        KAFKA_SEND
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        let payload = coerce(self.name(), &data)?;
        let producer = self.producer(ctx).await?;

        let record = FutureRecord::<(), [u8]>::to(&self.endpoint.topic)
            .payload(&payload)
            .partition(self.endpoint.partition);
        match producer.send(record, DELIVERY_TIMEOUT).await {
            Ok((partition, offset)) => {
                tracing::info!(
                    pipeline_id = ctx.pipeline_id(),
                    correlation_id = ctx.correlation_id(),
                    topic = %self.endpoint.topic,
                    partition,
                    offset,
                    "message sent to Kafka"
                );
                Ok(data)
            }
            Err((err, _)) => {
                let action = if self.persist_on_error {
                    ctx.set_retry_data(payload);
                    "persisting Event for later retry"
                } else {
                    "drop event"
                };
                tracing::error!(
                    pipeline_id = ctx.pipeline_id(),
                    correlation_id = ctx.correlation_id(),
                    topic = %self.endpoint.topic,
                    error = %err,
                    "Kafka send failed"
                );
                Err(SenderError::Transport(format!(
                    "failed to send message from kafka producer, {action}. Error: {err}"
                )))
            }
        }
    }
}
