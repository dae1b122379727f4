//! Builds senders from the string-keyed parameter maps of a pipeline definition.

use crate::error::ConfigError;
use crate::http::sigv4::AwsSignerConfig;
use crate::http::{HttpAuthMode, HttpSender, HttpSenderConfig};
use crate::influxdb::{
    InfluxAuthMode, InfluxDbWriter, InfluxDbWriterConfig, InfluxValueType, Precision,
    DEFAULT_FIELD_KEY_PATTERN, DEFAULT_MEASUREMENT,
};
use crate::kafka::{KafkaAuthMode, KafkaEndpoint, KafkaSecretsConfig, KafkaSender};
use crate::mqtt::{
    AuthMode, AwsExportMode, AwsIotCoreClientFactory, AwsIotCoreSender, AzureExportMode,
    AzureIotHubClientFactory, AzureIotHubSender, BrokerSettings, MqttSender, PublishSettings,
    RegularClientFactory, WatsonClientFactory,
};
use crate::postgres::{
    default_max_conn, PostgresWriter, PostgresWriterConfig, DEFAULT_CHUNK_TIME_INTERVAL,
    DEFAULT_DATABASE, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TABLE,
};
use crate::sender::Sender;
use crate::tls::RenegotiationSupport;
use reqwest::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

pub const EXPORT_MODE: &str = "exportmode";
pub const USE_SHARED_CLIENT: &str = "usesharedclient";
pub const BROKER_ADDRESS: &str = "brokeraddress";
pub const TOPIC: &str = "topic";
pub const QOS: &str = "qos";
pub const AUTO_RECONNECT: &str = "autoreconnect";
pub const RETAIN: &str = "retain";
pub const SKIP_VERIFY: &str = "skipverify";
pub const AUTH_MODE: &str = "authmode";
pub const SECRET_PATH: &str = "secretpath";
pub const CLIENT_ID: &str = "clientid";
pub const PERSIST_ON_ERROR: &str = "persistonerror";

pub const METHOD: &str = "method";
pub const URL: &str = "url";
pub const MIME_TYPE: &str = "mimetype";
pub const HEADER_NAME: &str = "headername";
pub const SECRET_NAME: &str = "secretname";
pub const CONTINUE_ON_SEND_ERROR: &str = "continueonsenderror";
pub const RETURN_INPUT_DATA: &str = "returninputdata";
pub const RENEGOTIATION_SUPPORT: &str = "renegotiationsupport";
pub const HTTP_REQUEST_HEADERS: &str = "httprequestheaders";
pub const AWS_V4_SIGNER_CONFIGS: &str = "awsv4signerconfigs";

pub const KAFKA_ADDRESS: &str = "address";
pub const PORT: &str = "port";
pub const KAFKA_PARTITION: &str = "partition";

pub const INFLUXDB_SERVER_URL: &str = "influxdbserverurl";
pub const INFLUXDB_ORGANIZATION: &str = "influxdborganization";
pub const INFLUXDB_BUCKET: &str = "influxdbbucket";
pub const INFLUXDB_MEASUREMENT: &str = "influxdbmeasurement";
pub const INFLUXDB_VALUE_TYPE: &str = "influxdbvaluetype";
pub const INFLUXDB_PRECISION: &str = "influxdbprecision";
pub const STORE_EVENT_TAGS: &str = "storeeventtags";
pub const STORE_READING_TAGS: &str = "storereadingtags";
pub const FIELD_KEY_PATTERN: &str = "fieldkeypattern";

pub const POSTGRES_HOST: &str = "host";
pub const POSTGRES_DATABASE_NAME: &str = "databasename";
pub const POSTGRES_TABLE_NAME: &str = "tablename";
pub const POSTGRES_STORE_EVENT_ID: &str = "storeeventid";
pub const POSTGRES_CHUNK_TIME_INTERVAL: &str = "chunktimeinterval";
pub const POSTGRES_MAX_CONN: &str = "maxconn";

/// Accepts `1`, `t`, `true`, `0`, `f` and `false` in any case.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// Function parameters with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.0
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn required(&self, name: &str) -> Result<&str, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn bool_or(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(name) {
            None => {
                tracing::debug!(parameter = name, default, "parameter not set, using default");
                Ok(default)
            }
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                ConfigError::invalid_value(name, raw, "could not parse to a bool")
            }),
        }
    }

    fn number_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|err: T::Err| ConfigError::invalid_value(name, raw, err.to_string())),
        }
    }

    fn persist_on_error(&self) -> Result<bool, ConfigError> {
        self.bool_or(PERSIST_ON_ERROR, false)
    }
}

impl From<BTreeMap<String, String>> for Parameters {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Parameters::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Broker settings of the service-wide MQTT connection used in shared-client mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExternalMqttConfig {
    pub url: String,
    pub client_id: String,
    pub qos: u8,
    pub retain: bool,
    pub auto_reconnect: bool,
    pub skip_cert_verify: bool,
    pub auth_mode: String,
    pub secret_path: String,
}

impl ExternalMqttConfig {
    /// Overrides the broker and auth parameters with the shared connection's settings.
    pub fn apply_shared(&self, params: &mut Parameters) {
        params.insert(BROKER_ADDRESS, self.url.clone());
        params.insert(CLIENT_ID, self.client_id.clone());
        params.insert(QOS, self.qos.to_string());
        params.insert(RETAIN, self.retain.to_string());
        params.insert(AUTO_RECONNECT, self.auto_reconnect.to_string());
        params.insert(SKIP_VERIFY, self.skip_cert_verify.to_string());
        params.insert(AUTH_MODE, self.auth_mode.clone());
        params.insert(SECRET_PATH, self.secret_path.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttExportMode {
    Mqtt,
    AwsIotCore,
    AwsIotCoreResponse,
    AzureIotHub,
    AzureDirectMethodResponse,
    IbmWatson,
}

impl MqttExportMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Some(Self::Mqtt),
            "awsiotcore" => Some(Self::AwsIotCore),
            "awsiotcoreresponse" => Some(Self::AwsIotCoreResponse),
            "azureiothub" => Some(Self::AzureIotHub),
            "azuredirectmethodresponse" => Some(Self::AzureDirectMethodResponse),
            "ibmwatson" => Some(Self::IbmWatson),
            _ => None,
        }
    }

    /// Response modes reply on the connection the request arrived on.
    pub fn always_shared(self) -> bool {
        matches!(self, Self::AwsIotCoreResponse | Self::AzureDirectMethodResponse)
    }
}

/// Broker and publish settings resolved from MQTT parameters.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker: BrokerSettings,
    pub publish: PublishSettings,
}

fn parse_qos(params: &Parameters) -> Result<u8, ConfigError> {
    let qos: u8 = params.number_or(QOS, 0)?;
    if qos > 2 {
        return Err(ConfigError::invalid_value(QOS, qos.to_string(), "must be 0, 1 or 2"));
    }
    Ok(qos)
}

fn mqtt_common(
    params: &Parameters,
    client_id: &str,
    qos: u8,
) -> Result<MqttConfig, ConfigError> {
    let broker_address = params.required(BROKER_ADDRESS)?;
    let topic = params.required(TOPIC)?;
    let mut publish = PublishSettings::new(broker_address, topic, qos)?;
    publish.persist_on_error = params.persist_on_error()?;
    publish.retain = params.bool_or(RETAIN, false)?;

    let mut broker = BrokerSettings::new(broker_address, client_id);
    broker.auto_reconnect = params.bool_or(AUTO_RECONNECT, false)?;
    broker.skip_verify = params.bool_or(SKIP_VERIFY, false)?;
    Ok(MqttConfig { broker, publish })
}

fn parse_auth_mode(params: &Parameters) -> Result<AuthMode, ConfigError> {
    let raw = params.required(AUTH_MODE)?;
    AuthMode::parse(raw).ok_or_else(|| ConfigError::invalid_value(AUTH_MODE, raw, "unsupported auth mode"))
}

/// Generic broker: `authmode` is mandatory and `secretpath` is required unless it is `none`.
pub fn load_regular_mqtt(params: &Parameters) -> Result<MqttConfig, ConfigError> {
    let qos = parse_qos(params)?;
    let client_id = params.get(CLIENT_ID).unwrap_or_default();
    let mut config = mqtt_common(params, client_id, qos)?;
    config.broker.auth_mode = parse_auth_mode(params)?;
    if config.broker.auth_mode != AuthMode::None {
        config.broker.secret_path = params.required(SECRET_PATH)?.to_string();
    }
    Ok(config)
}

/// AWS IoT Core accepts QoS 0 and 1 only and never retains.
pub fn load_aws_mqtt(params: &Parameters) -> Result<MqttConfig, ConfigError> {
    params.required(BROKER_ADDRESS)?;
    params.required(TOPIC)?;
    let client_id = params.required(CLIENT_ID)?;
    let qos: u8 = params.number_or(QOS, 0)?;
    if qos > 1 {
        return Err(ConfigError::Invalid(format!("AWS IoT doesn't support QoS: {qos}")));
    }
    let mut config = mqtt_common(params, client_id, qos)?;
    config.publish.retain = false;
    config.broker.auth_mode = AuthMode::ClientCert;
    config.broker.secret_path = params.required(SECRET_PATH)?.to_string();
    Ok(config)
}

/// Azure IoT Hub only supports client certificate auth.
pub fn load_azure_mqtt(params: &Parameters) -> Result<MqttConfig, ConfigError> {
    params.required(BROKER_ADDRESS)?;
    params.required(TOPIC)?;
    let client_id = params.required(CLIENT_ID)?;
    let qos = parse_qos(params)?;
    let mut config = mqtt_common(params, client_id, qos)?;
    config.broker.secret_path = params.required(SECRET_PATH)?.to_string();
    let raw = params.required(AUTH_MODE)?;
    if AuthMode::parse(raw) != Some(AuthMode::ClientCert) {
        return Err(ConfigError::invalid_value(AUTH_MODE, raw, "only clientcert is supported"));
    }
    config.broker.auth_mode = AuthMode::ClientCert;
    Ok(config)
}

/// IBM Watson IoT: username/password taken from the secret path.
pub fn load_watson_mqtt(params: &Parameters) -> Result<MqttConfig, ConfigError> {
    params.required(BROKER_ADDRESS)?;
    params.required(TOPIC)?;
    let client_id = params.required(CLIENT_ID)?;
    let secret_path = params.required(SECRET_PATH)?;
    let qos = parse_qos(params)?;
    let mut config = mqtt_common(params, client_id, qos)?;
    config.broker.auth_mode = AuthMode::UsernamePassword;
    config.broker.secret_path = secret_path.to_string();
    Ok(config)
}

/// Builds the `XpertMQTTExport` stage selected by `exportmode`.
///
/// In shared-client mode the broker and auth parameters come from `external`
/// rather than from `params`.
pub fn mqtt_export(
    params: &Parameters,
    external: Option<&ExternalMqttConfig>,
) -> Result<Box<dyn Sender>, ConfigError> {
    let raw_mode = params.required(EXPORT_MODE)?;
    let mode = MqttExportMode::parse(raw_mode).ok_or_else(|| {
        ConfigError::invalid_value(
            EXPORT_MODE,
            raw_mode,
            "expected one of mqtt, awsiotcore, awsiotcoreresponse, azureiothub, azuredirectmethodresponse, ibmwatson",
        )
    })?;
    let use_shared_client = mode.always_shared() || params.bool_or(USE_SHARED_CLIENT, false)?;

    let mut params = params.clone();
    if mode == MqttExportMode::AzureDirectMethodResponse {
        // the reply topic is derived from the received request
        params.insert(TOPIC, "");
    }
    if use_shared_client {
        let external = external.ok_or_else(|| {
            ConfigError::Invalid(
                "shared MQTT client requested but no external MQTT configuration is set".to_string(),
            )
        })?;
        external.apply_shared(&mut params);
    }

    let sender: Box<dyn Sender> = match mode {
        MqttExportMode::Mqtt => {
            let MqttConfig { broker, mut publish } = load_regular_mqtt(&params)?;
            publish.use_shared_client = use_shared_client;
            Box::new(MqttSender::new(
                Arc::new(RegularClientFactory::new(broker)),
                publish,
            ))
        }
        MqttExportMode::AwsIotCore | MqttExportMode::AwsIotCoreResponse => {
            let MqttConfig { broker, mut publish } = load_aws_mqtt(&params)?;
            publish.use_shared_client = use_shared_client;
            let export_mode = if mode == MqttExportMode::AwsIotCore {
                AwsExportMode::Publish
            } else {
                AwsExportMode::Response
            };
            Box::new(AwsIotCoreSender::new(
                Arc::new(AwsIotCoreClientFactory::new(broker)),
                publish,
                export_mode,
            )?)
        }
        MqttExportMode::AzureIotHub | MqttExportMode::AzureDirectMethodResponse => {
            let MqttConfig { broker, mut publish } = load_azure_mqtt(&params)?;
            publish.use_shared_client = use_shared_client;
            let export_mode = if mode == MqttExportMode::AzureIotHub {
                AzureExportMode::Publish
            } else {
                AzureExportMode::DirectMethodResponse
            };
            Box::new(AzureIotHubSender::new(
                Arc::new(AzureIotHubClientFactory::new(broker)),
                publish,
                export_mode,
            ))
        }
        MqttExportMode::IbmWatson => {
            let MqttConfig { broker, mut publish } = load_watson_mqtt(&params)?;
            publish.use_shared_client = use_shared_client;
            Box::new(MqttSender::new(
                Arc::new(WatsonClientFactory::new(broker)),
                publish,
            ))
        }
    };
    tracing::info!(mode = raw_mode, shared = use_shared_client, "configured MQTT export");
    Ok(sender)
}

fn parse_method(params: &Parameters) -> Result<Method, ConfigError> {
    let raw = params.required(METHOD)?;
    match raw.trim().to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        _ => Err(ConfigError::invalid_value(
            METHOD,
            raw,
            "must be one of GET, POST, PUT, PATCH or DELETE",
        )),
    }
}

/// Resolves `XpertHTTPExport` parameters. Auth-specific requirements are
/// checked again by [`HttpSender::new`].
pub fn http_sender_config(params: &Parameters) -> Result<HttpSenderConfig, ConfigError> {
    let method = parse_method(params)?;
    let url = params.required(URL)?.trim();
    let mime_type = params.required(MIME_TYPE)?.trim();
    let mut config = HttpSenderConfig::new(url, mime_type, method);
    config.persist_on_error = params.persist_on_error()?;
    config.continue_on_send_error = params.bool_or(CONTINUE_ON_SEND_ERROR, false)?;
    config.return_input_data = params.bool_or(RETURN_INPUT_DATA, false)?;
    config.skip_verify = params.bool_or(SKIP_VERIFY, false)?;

    if let Some(raw) = params.get(AUTH_MODE) {
        config.auth_mode = HttpAuthMode::parse(raw)
            .ok_or_else(|| ConfigError::invalid_value(AUTH_MODE, raw, "unsupported auth mode"))?;
    }
    // also used with authmode none, to trust a self-signed server CA
    if let Some(path) = params.get(SECRET_PATH) {
        config.secret_path = path.trim().to_string();
    }

    match config.auth_mode {
        HttpAuthMode::HeaderSecret => {
            config.header_name = params.get(HEADER_NAME).unwrap_or_default().trim().to_string();
            config.secret_name = params.get(SECRET_NAME).unwrap_or_default().trim().to_string();
        }
        HttpAuthMode::ClientCert => {
            if let Some(raw) = params.get(RENEGOTIATION_SUPPORT) {
                config.renegotiation = RenegotiationSupport::from_code(raw).ok_or_else(|| {
                    ConfigError::invalid_value(RENEGOTIATION_SUPPORT, raw, "must be 0, 1 or 2")
                })?;
            }
        }
        HttpAuthMode::AwsSignature => {
            let raw = params
                .get(AWS_V4_SIGNER_CONFIGS)
                .filter(|raw| !raw.trim().is_empty())
                .ok_or_else(|| ConfigError::Missing(AWS_V4_SIGNER_CONFIGS.to_string()))?;
            let signer: AwsSignerConfig = serde_json::from_str(raw).map_err(|err| {
                ConfigError::invalid_value(AWS_V4_SIGNER_CONFIGS, raw, err.to_string())
            })?;
            config.aws_signer = Some(signer);
        }
        HttpAuthMode::None | HttpAuthMode::OAuth2ClientCredentials => {}
    }

    if let Some(raw) = params.get(HTTP_REQUEST_HEADERS).filter(|raw| !raw.trim().is_empty()) {
        config.request_headers = serde_json::from_str(raw).map_err(|err| {
            ConfigError::invalid_value(HTTP_REQUEST_HEADERS, raw, err.to_string())
        })?;
    }
    Ok(config)
}

pub fn http_export(params: &Parameters) -> Result<HttpSender, ConfigError> {
    HttpSender::new(http_sender_config(params)?)
}

pub fn kafka_send(params: &Parameters) -> Result<KafkaSender, ConfigError> {
    let client_id = params.required(CLIENT_ID)?;
    let address = params.required(KAFKA_ADDRESS)?;
    let raw_port = params.required(PORT)?;
    let port: u16 = raw_port
        .trim()
        .parse()
        .map_err(|err: std::num::ParseIntError| ConfigError::invalid_value(PORT, raw_port, err.to_string()))?;
    let topic = params.required(TOPIC)?;
    let partition: i32 = params.number_or(KAFKA_PARTITION, 0)?;
    let persist_on_error = params.persist_on_error()?;

    let endpoint = KafkaEndpoint {
        client_id: client_id.to_string(),
        address: address.to_string(),
        port,
        topic: topic.to_string(),
        partition,
    };

    let mut secrets = KafkaSecretsConfig {
        skip_verify: params.bool_or(SKIP_VERIFY, false)?,
        ..KafkaSecretsConfig::default()
    };
    if let Some(raw) = params.get(AUTH_MODE) {
        secrets.auth_mode = KafkaAuthMode::parse(raw).ok_or_else(|| {
            ConfigError::invalid_value(AUTH_MODE, raw, "only none and clientcert are supported")
        })?;
    }
    if secrets.auth_mode == KafkaAuthMode::ClientCert {
        secrets.secret_path = params.required(SECRET_PATH)?.to_string();
    }
    KafkaSender::new(endpoint, secrets, persist_on_error)
}

pub fn influxdb_writer_config(params: &Parameters) -> Result<InfluxDbWriterConfig, ConfigError> {
    let mut config = InfluxDbWriterConfig::new(params.required(INFLUXDB_SERVER_URL)?);
    if let Some(raw) = params.get(AUTH_MODE) {
        config.auth_mode = InfluxAuthMode::parse(raw).ok_or_else(|| {
            ConfigError::invalid_value(AUTH_MODE, raw, "only none and token are supported")
        })?;
    }
    if config.auth_mode != InfluxAuthMode::None {
        config.secret_path = params.required(SECRET_PATH)?.to_string();
    }
    for (name, field) in [
        (INFLUXDB_ORGANIZATION, &mut config.org),
        (INFLUXDB_BUCKET, &mut config.bucket),
    ] {
        match params.get(name) {
            Some(value) => *field = value.to_string(),
            None => tracing::warn!(parameter = name, "parameter not set, using empty string"),
        }
    }
    config.measurement = params
        .get(INFLUXDB_MEASUREMENT)
        .unwrap_or(DEFAULT_MEASUREMENT)
        .to_string();
    if let Some(raw) = params.get(INFLUXDB_VALUE_TYPE) {
        config.value_type = InfluxValueType::parse(raw).ok_or_else(|| {
            ConfigError::invalid_value(INFLUXDB_VALUE_TYPE, raw, "unrecognized influxdb value type")
        })?;
    }
    if let Some(raw) = params.get(INFLUXDB_PRECISION) {
        config.precision = Precision::parse(raw).ok_or_else(|| {
            ConfigError::invalid_value(INFLUXDB_PRECISION, raw, "unrecognized precision")
        })?;
    }
    config.skip_verify = params.bool_or(SKIP_VERIFY, false)?;
    config.store_event_tags = params.bool_or(STORE_EVENT_TAGS, false)?;
    config.store_reading_tags = params.bool_or(STORE_READING_TAGS, false)?;
    config.field_key_pattern = params
        .get(FIELD_KEY_PATTERN)
        .unwrap_or(DEFAULT_FIELD_KEY_PATTERN)
        .to_string();
    Ok(config)
}

pub fn influxdb_sync_write(params: &Parameters) -> Result<InfluxDbWriter, ConfigError> {
    InfluxDbWriter::new(influxdb_writer_config(params)?, params.persist_on_error()?)
}

pub fn postgres_writer_config(params: &Parameters) -> Result<PostgresWriterConfig, ConfigError> {
    let raw_mode = params.required(AUTH_MODE)?;
    if AuthMode::parse(raw_mode) != Some(AuthMode::UsernamePassword) {
        return Err(ConfigError::invalid_value(
            AUTH_MODE,
            raw_mode,
            "only usernamepassword is supported",
        ));
    }
    let mut config = PostgresWriterConfig::new(params.required(SECRET_PATH)?);
    config.host = params.get(POSTGRES_HOST).unwrap_or(DEFAULT_HOST).to_string();
    config.port = params.number_or(PORT, DEFAULT_PORT)?;
    config.database_name = params
        .get(POSTGRES_DATABASE_NAME)
        .unwrap_or(DEFAULT_DATABASE)
        .to_string();
    config.table_name = params
        .get(POSTGRES_TABLE_NAME)
        .unwrap_or(DEFAULT_TABLE)
        .to_string();
    config.chunk_time_interval = params
        .get(POSTGRES_CHUNK_TIME_INTERVAL)
        .unwrap_or(DEFAULT_CHUNK_TIME_INTERVAL)
        .to_string();
    config.max_conn = params.number_or(POSTGRES_MAX_CONN, default_max_conn())?;
    config.store_event_id = params.bool_or(POSTGRES_STORE_EVENT_ID, false)?;
    Ok(config)
}

pub fn postgres_write(params: &Parameters) -> Result<PostgresWriter, ConfigError> {
    PostgresWriter::new(postgres_writer_config(params)?, params.persist_on_error()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::SendErrorPolicy;
    use crate::mqtt::QoS;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs.iter().copied().collect()
    }

    #[test]
    fn bools_follow_strconv_spellings() {
        for raw in ["1", "t", "T", "TRUE", "true", "True", " true "] {
            assert_eq!(parse_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "f", "F", "FALSE", "false", "False"] {
            assert_eq!(parse_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_bool("yes"), None);
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn parameter_names_ignore_case() {
        let p = params(&[("BrokerAddress", "tcp://localhost:1883")]);
        assert_eq!(p.get("brokeraddress"), Some("tcp://localhost:1883"));
        assert_eq!(p.get("BROKERADDRESS"), Some("tcp://localhost:1883"));
        assert!(!p.contains("topic"));
    }

    #[test]
    fn regular_mqtt_defaults() {
        let p = params(&[
            ("brokeraddress", "tcp://localhost:1883"),
            ("topic", "edgex/events"),
            ("authmode", "none"),
        ]);
        let config = load_regular_mqtt(&p).unwrap();
        assert_eq!(config.publish.qos, QoS::AtMostOnce);
        assert!(!config.publish.retain);
        assert!(!config.publish.persist_on_error);
        assert!(!config.broker.auto_reconnect);
        assert!(!config.broker.skip_verify);
        assert_eq!(config.broker.auth_mode, AuthMode::None);
        assert_eq!(config.broker.secret_path, "");
        assert_eq!(config.broker.client_id, "");
    }

    #[test]
    fn regular_mqtt_rejections() {
        let base = [
            ("brokeraddress", "tcp://localhost:1883"),
            ("topic", "t"),
            ("authmode", "usernamepassword"),
        ];
        assert_eq!(
            load_regular_mqtt(&params(&base)).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );

        let mut p = params(&base);
        p.insert("secretpath", "mqtt");
        p.insert("qos", "3");
        assert!(matches!(
            load_regular_mqtt(&p),
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "qos"
        ));

        let mut p = params(&base);
        p.insert("secretpath", "mqtt");
        p.insert("retain", "maybe");
        assert!(load_regular_mqtt(&p).is_err());

        assert_eq!(
            load_regular_mqtt(&params(&[("brokeraddress", "x"), ("topic", "t")])).err(),
            Some(ConfigError::Missing("authmode".to_string()))
        );
    }

    #[test]
    fn aws_rejects_qos_two_and_never_retains() {
        let mut p = params(&[
            ("brokeraddress", "ssl://example.iot.amazonaws.com:8883"),
            ("topic", "t"),
            ("clientid", "edge"),
            ("secretpath", "aws"),
            ("retain", "true"),
        ]);
        let config = load_aws_mqtt(&p).unwrap();
        assert!(!config.publish.retain);
        assert_eq!(config.broker.auth_mode, AuthMode::ClientCert);

        p.insert("qos", "2");
        assert_eq!(
            load_aws_mqtt(&p).err(),
            Some(ConfigError::Invalid("AWS IoT doesn't support QoS: 2".to_string()))
        );
    }

    #[test]
    fn azure_requires_client_cert() {
        let mut p = params(&[
            ("brokeraddress", "ssl://hub.azure-devices.net:8883"),
            ("topic", "t"),
            ("clientid", "edge"),
            ("secretpath", "azure"),
            ("authmode", "usernamepassword"),
        ]);
        assert!(load_azure_mqtt(&p).is_err());
        p.insert("authmode", "ClientCert");
        assert_eq!(load_azure_mqtt(&p).unwrap().broker.auth_mode, AuthMode::ClientCert);
    }

    #[test]
    fn watson_needs_secret_path() {
        let p = params(&[("brokeraddress", "x"), ("topic", "t"), ("clientid", "c")]);
        assert_eq!(
            load_watson_mqtt(&p).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );
    }

    #[test]
    fn export_modes() {
        assert_eq!(MqttExportMode::parse("AWSIoTCore"), Some(MqttExportMode::AwsIotCore));
        assert!(MqttExportMode::parse("azuredirectmethodresponse")
            .unwrap()
            .always_shared());
        assert!(!MqttExportMode::Mqtt.always_shared());
        assert_eq!(MqttExportMode::parse("kafka"), None);

        let err = mqtt_export(&params(&[("exportmode", "kafka")]), None).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(
            mqtt_export(&params(&[]), None).err().map(|e| e.to_string()),
            Some("mandatory parameter `exportmode` not found".to_string())
        );
    }

    #[test]
    fn shared_mode_takes_external_broker_settings() {
        let external = ExternalMqttConfig {
            url: "tcp://shared:1883".to_string(),
            client_id: "service".to_string(),
            qos: 1,
            auth_mode: "none".to_string(),
            ..ExternalMqttConfig::default()
        };
        let p = params(&[
            ("exportmode", "mqtt"),
            ("usesharedclient", "true"),
            ("brokeraddress", "tcp://ignored:1883"),
            ("topic", "t"),
        ]);
        let sender = mqtt_export(&p, Some(&external)).unwrap();
        assert_eq!(sender.name(), crate::mqtt::MQTT_EXPORT);

        let mut overridden = p.clone();
        external.apply_shared(&mut overridden);
        assert_eq!(overridden.get("brokeraddress"), Some("tcp://shared:1883"));
        assert_eq!(overridden.get("qos"), Some("1"));

        assert!(mqtt_export(&p, None).is_err());
        let response = params(&[("exportmode", "azuredirectmethodresponse")]);
        assert!(matches!(mqtt_export(&response, None), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn http_config_parsing() {
        let p = params(&[
            ("method", "put"),
            ("url", " https://example.com/{device} "),
            ("mimetype", "application/json"),
            ("returninputdata", "true"),
            ("continueonsenderror", "true"),
            ("secretpath", "https"),
            ("httprequestheaders", r#"{"X-Site":"plant-1"}"#),
        ]);
        let config = http_sender_config(&p).unwrap();
        assert_eq!(config.method, Method::PUT);
        assert_eq!(config.url, "https://example.com/{device}");
        assert_eq!(config.secret_path, "https");
        assert_eq!(config.request_headers.get("X-Site").map(String::as_str), Some("plant-1"));
        assert_eq!(
            HttpSender::new(config).unwrap().policy(),
            SendErrorPolicy::ContinueWithInputData
        );
    }

    #[test]
    fn http_rejections() {
        let base = [("url", "http://x"), ("mimetype", "text/plain")];
        let mut p = params(&base);
        p.insert("method", "HEAD");
        assert!(matches!(
            http_sender_config(&p),
            Err(ConfigError::InvalidValue { ref name, .. }) if name == "method"
        ));

        let mut p = params(&base);
        p.insert("method", "post");
        p.insert("persistonerror", "true");
        p.insert("continueonsenderror", "true");
        assert!(http_export(&p).is_err());

        let mut p = params(&base);
        p.insert("method", "post");
        p.insert("authmode", "aws_signature");
        p.insert("secretpath", "aws");
        assert_eq!(
            http_export(&p).err(),
            Some(ConfigError::Missing("awsv4signerconfigs".to_string()))
        );
        p.insert("awsv4signerconfigs", r#"{"Region":"us-east-1"}"#);
        assert_eq!(
            http_export(&p).err(),
            Some(ConfigError::Missing("awsv4signerconfigs.service".to_string()))
        );
        p.insert("awsv4signerconfigs", r#"{"Region":"us-east-1","Service":"execute-api"}"#);
        assert!(http_export(&p).is_ok());

        let mut p = params(&base);
        p.insert("method", "post");
        p.insert("authmode", "clientcert");
        p.insert("secretpath", "tls");
        p.insert("renegotiationsupport", "7");
        assert!(http_export(&p).is_err());
        p.insert("renegotiationsupport", "1");
        assert_eq!(
            http_sender_config(&p).unwrap().renegotiation,
            RenegotiationSupport::OnceAsClient
        );
    }

    #[test]
    fn kafka_parameters() {
        let mut p = params(&[
            ("clientid", "edge"),
            ("address", "broker"),
            ("port", "9092"),
            ("topic", "events"),
        ]);
        let sender = kafka_send(&p).unwrap();
        assert_eq!(sender.endpoint().partition, 0);
        assert_eq!(sender.endpoint().port, 9092);

        p.insert("authmode", "clientcert");
        assert_eq!(
            kafka_send(&p).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );
        p.insert("authmode", "usernamepassword");
        assert!(kafka_send(&p).is_err());
        p.insert("authmode", "none");
        p.insert("port", "ninety");
        assert!(kafka_send(&p).is_err());
    }

    #[test]
    fn influxdb_defaults_and_rejections() {
        let mut p = params(&[("influxdbserverurl", "http://localhost:8086")]);
        let config = influxdb_writer_config(&p).unwrap();
        assert_eq!(config.measurement, DEFAULT_MEASUREMENT);
        assert_eq!(config.value_type, InfluxValueType::Float);
        assert_eq!(config.precision, Precision::Microseconds);
        assert_eq!(config.field_key_pattern, "value");
        assert_eq!(config.org, "");

        p.insert("influxdbprecision", "ms");
        p.insert("influxdbvaluetype", "Integer");
        let config = influxdb_writer_config(&p).unwrap();
        assert_eq!(config.precision, Precision::Milliseconds);
        assert_eq!(config.value_type, InfluxValueType::Integer);

        p.insert("authmode", "token");
        assert_eq!(
            influxdb_writer_config(&p).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );
        p.insert("authmode", "none");
        p.insert("influxdbprecision", "minutes");
        assert!(influxdb_writer_config(&p).is_err());
    }

    #[test]
    fn postgres_defaults_and_rejections() {
        let mut p = params(&[("authmode", "usernamepassword"), ("secretpath", "postgres")]);
        let config = postgres_writer_config(&p).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.database_name, DEFAULT_DATABASE);
        assert_eq!(config.table_name, DEFAULT_TABLE);
        assert_eq!(config.chunk_time_interval, DEFAULT_CHUNK_TIME_INTERVAL);
        assert!(!config.store_event_id);

        p.insert("maxconn", "0");
        assert!(postgres_write(&p).is_err());
        p.insert("maxconn", "4");
        p.insert("tablename", "readings; DROP TABLE x");
        assert!(postgres_write(&p).is_err());

        assert!(postgres_writer_config(&params(&[("authmode", "none"), ("secretpath", "p")])).is_err());
        assert_eq!(
            postgres_writer_config(&params(&[("authmode", "usernamepassword")])).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );
    }
}
