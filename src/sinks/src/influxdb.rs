//! InfluxDB 2.x writer: events become line-protocol points posted to `/api/v2/write`.

use crate::configurable::parse_bool;
use crate::context::AppFunctionContext;
use crate::data::{events_from_data, PipelineData};
use crate::error::{ConfigError, SenderError};
use crate::model::{to_nanoseconds, value_type, Event, Reading};
use crate::secrets::non_empty;
use crate::sender::{require_data, Sender};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub const INFLUXDB_SYNC_WRITE: &str = "InfluxDBSyncWrite";
pub const DEFAULT_MEASUREMENT: &str = "readings";
pub const DEFAULT_FIELD_KEY_PATTERN: &str = "value";
pub const SECRET_AUTH_TOKEN: &str = "token";

const TAG_DEVICE_NAME: &str = "deviceName";
const TAG_RESOURCE_NAME: &str = "resourceName";
const FIELD_KEY_PLACEHOLDERS: [&str; 4] = [
    "{resourceName}",
    "{deviceName}",
    "{profileName}",
    "{valueType}",
];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfluxAuthMode {
    #[default]
    None,
    Token,
}

impl InfluxAuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "token" => Some(Self::Token),
            _ => None,
        }
    }
}

/// Field type every written point must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfluxValueType {
    #[default]
    Float,
    Integer,
    UInteger,
    String,
    Boolean,
}

impl InfluxValueType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "float" => Some(Self::Float),
            "integer" => Some(Self::Integer),
            "uinteger" => Some(Self::UInteger),
            "string" => Some(Self::String),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Whether a reading of EdgeX `reading_type` maps onto this field type.
    pub fn accepts(self, reading_type: &str) -> bool {
        let expected = match reading_type {
            value_type::FLOAT32 | value_type::FLOAT64 => Self::Float,
            value_type::INT8 | value_type::INT16 | value_type::INT32 | value_type::INT64 => {
                Self::Integer
            }
            value_type::UINT8 | value_type::UINT16 | value_type::UINT32 | value_type::UINT64 => {
                Self::UInteger
            }
            value_type::BOOL => Self::Boolean,
            _ => Self::String,
        };
        expected == self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Nanoseconds,
    #[default]
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Precision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ns" => Some(Self::Nanoseconds),
            "us" => Some(Self::Microseconds),
            "ms" => Some(Self::Milliseconds),
            "s" => Some(Self::Seconds),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
        }
    }

    fn scale(self, nanos: i64) -> i64 {
        match self {
            Self::Nanoseconds => nanos,
            Self::Microseconds => nanos / 1_000,
            Self::Milliseconds => nanos / 1_000_000,
            Self::Seconds => nanos / 1_000_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfluxDbWriterConfig {
    pub server_url: String,
    pub auth_mode: InfluxAuthMode,
    pub secret_path: String,
    pub org: String,
    pub bucket: String,
    pub measurement: String,
    pub value_type: InfluxValueType,
    pub precision: Precision,
    pub skip_verify: bool,
    pub store_event_tags: bool,
    pub store_reading_tags: bool,
    pub field_key_pattern: String,
}

impl InfluxDbWriterConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            auth_mode: InfluxAuthMode::None,
            secret_path: String::new(),
            org: String::new(),
            bucket: String::new(),
            measurement: DEFAULT_MEASUREMENT.to_string(),
            value_type: InfluxValueType::Float,
            precision: Precision::Microseconds,
            skip_verify: false,
            store_event_tags: false,
            store_reading_tags: false,
            field_key_pattern: DEFAULT_FIELD_KEY_PATTERN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

/// A single line-protocol point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    field_key: String,
    field: FieldValue,
    timestamp: i64,
}

impl Point {
    /// Renders the point with its timestamp scaled to `precision`.
    pub fn to_line(&self, precision: Precision) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            if value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }
        line.push(' ');
        line.push_str(&escape(&self.field_key, &[',', '=', ' ']));
        line.push('=');
        match &self.field {
            FieldValue::Float(v) => line.push_str(&v.to_string()),
            FieldValue::Integer(v) => line.push_str(&format!("{v}i")),
            FieldValue::UInteger(v) => line.push_str(&format!("{v}u")),
            FieldValue::Boolean(v) => line.push_str(if *v { "true" } else { "false" }),
            FieldValue::String(v) => {
                line.push('"');
                line.push_str(&escape(v, &['"', '\\']));
                line.push('"');
            }
        }
        line.push(' ');
        line.push_str(&precision.scale(self.timestamp).to_string());
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn tag_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn field_key(reading: &Reading, pattern: &str) -> String {
    pattern
        .replace("{resourceName}", &reading.resource_name)
        .replace("{deviceName}", &reading.device_name)
        .replace("{profileName}", &reading.profile_name)
        .replace("{valueType}", &reading.value_type)
}

fn parse_value(reading: &Reading) -> Result<FieldValue, String> {
    let raw = reading.value.as_str();
    let require = || {
        if raw.is_empty() {
            Err("zero-length reading value found".to_string())
        } else {
            Ok(raw)
        }
    };
    let int_err = |err: std::num::ParseIntError| {
        format!(
            "failed to parse non-empty reading value {raw} as {}. Error: {err}",
            reading.value_type
        )
    };
    Ok(match reading.value_type.as_str() {
        value_type::INT8 => FieldValue::Integer(require()?.parse::<i8>().map_err(int_err)?.into()),
        value_type::INT16 => FieldValue::Integer(require()?.parse::<i16>().map_err(int_err)?.into()),
        value_type::INT32 => FieldValue::Integer(require()?.parse::<i32>().map_err(int_err)?.into()),
        value_type::INT64 => FieldValue::Integer(require()?.parse::<i64>().map_err(int_err)?),
        value_type::UINT8 => FieldValue::UInteger(require()?.parse::<u8>().map_err(int_err)?.into()),
        value_type::UINT16 => FieldValue::UInteger(require()?.parse::<u16>().map_err(int_err)?.into()),
        value_type::UINT32 => FieldValue::UInteger(require()?.parse::<u32>().map_err(int_err)?.into()),
        value_type::UINT64 => FieldValue::UInteger(require()?.parse::<u64>().map_err(int_err)?),
        value_type::FLOAT32 | value_type::FLOAT64 => {
            let text = require()?;
            let parsed = (if reading.value_type == value_type::FLOAT32 {
                // round-trip through the f32 text form so 21.1 stays 21.1
                text.parse::<f32>().map(|v| v.to_string()).and_then(|v| v.parse::<f64>())
            } else {
                text.parse::<f64>()
            })
            .map_err(|err| format!("failed to parse reading value '{text}' to float. Error: {err}"))?;
            if !parsed.is_finite() {
                return Err(format!("reading value '{text}' is not a finite float"));
            }
            FieldValue::Float(parsed)
        }
        value_type::BOOL => FieldValue::Boolean(parse_bool(require()?).ok_or_else(|| {
            format!("failed to parse reading value '{raw}' to boolean")
        })?),
        value_type::BINARY => FieldValue::String(
            String::from_utf8_lossy(reading.binary_value.as_deref().unwrap_or_default()).into_owned(),
        ),
        _ => FieldValue::String(raw.to_string()),
    })
}

/// Converts events to points. Readings whose type does not match the
/// configured field type are dropped unless the field key is templated.
pub fn to_points(config: &InfluxDbWriterConfig, events: &[Event]) -> Result<Vec<Point>, String> {
    let templated_key = FIELD_KEY_PLACEHOLDERS
        .iter()
        .any(|placeholder| config.field_key_pattern.contains(placeholder));

    let mut points = Vec::new();
    for event in events {
        for reading in &event.readings {
            if !templated_key && !config.value_type.accepts(&reading.value_type) {
                tracing::warn!(
                    value_type = %reading.value_type,
                    influxdb_value_type = ?config.value_type,
                    "reading's valueType doesn't match InfluxDBValueType, dropping reading"
                );
                continue;
            }

            let mut tags = BTreeMap::new();
            if config.store_event_tags {
                tags.extend(event.tags.iter().map(|(k, v)| (k.clone(), tag_text(v))));
            }
            if config.store_reading_tags {
                tags.extend(reading.tags.iter().map(|(k, v)| (k.clone(), tag_text(v))));
            }
            tags.insert(TAG_DEVICE_NAME.to_string(), reading.device_name.clone());
            tags.insert(TAG_RESOURCE_NAME.to_string(), reading.resource_name.clone());

            let origin = if reading.origin == 0 {
                event.origin
            } else {
                reading.origin
            };
            points.push(Point {
                measurement: config.measurement.clone(),
                tags,
                field_key: field_key(reading, &config.field_key_pattern),
                field: parse_value(reading)?,
                timestamp: to_nanoseconds(origin),
            });
        }
    }
    Ok(points)
}

struct WriteClient {
    http: reqwest::Client,
    token: Option<String>,
}

struct WriterState {
    client: Option<Arc<WriteClient>>,
    secrets_last_retrieved: OffsetDateTime,
}

pub struct InfluxDbWriter {
    config: InfluxDbWriterConfig,
    persist_on_error: bool,
    state: tokio::sync::Mutex<WriterState>,
}

impl InfluxDbWriter {
    pub fn new(config: InfluxDbWriterConfig, persist_on_error: bool) -> Result<Self, ConfigError> {
        if config.server_url.trim().is_empty() {
            return Err(ConfigError::Missing("influxdbserverurl".to_string()));
        }
        if config.auth_mode == InfluxAuthMode::Token && config.secret_path.trim().is_empty() {
            return Err(ConfigError::Missing("secretpath".to_string()));
        }
        Ok(Self {
            config,
            persist_on_error,
            state: tokio::sync::Mutex::new(WriterState {
                client: None,
                secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            }),
        })
    }

    async fn client(&self, ctx: &dyn AppFunctionContext) -> Result<Arc<WriteClient>, SenderError> {
        let mut state = self.state.lock().await;
        if state.secrets_last_retrieved >= ctx.secrets_last_updated() {
            if let Some(client) = state.client.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let token = match self.config.auth_mode {
            InfluxAuthMode::None => None,
            InfluxAuthMode::Token => {
                let secrets = ctx.get_secret(&self.config.secret_path).await?;
                let token = non_empty(&secrets, SECRET_AUTH_TOKEN).ok_or_else(|| {
                    SenderError::Credentials("mandatory secret authentication token is empty".to_string())
                })?;
                Some(token.to_string())
            }
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(self.config.skip_verify)
            .build()
            .map_err(|err| SenderError::Connection(format!("failed to build InfluxDB client: {err}")))?;
        tracing::info!(server = %self.config.server_url, "connecting to InfluxDB server");

        let client = Arc::new(WriteClient { http, token });
        state.client = Some(Arc::clone(&client));
        state.secrets_last_retrieved = OffsetDateTime::now_utc();
        Ok(client)
    }

    async fn write_lines(&self, client: &WriteClient, body: String) -> Result<(), String> {
        let url = format!("{}/api/v2/write", self.config.server_url.trim_end_matches('/'));
        let mut request = client
            .http
            .post(&url)
            .query(&[
                ("org", self.config.org.as_str()),
                ("bucket", self.config.bucket.as_str()),
                ("precision", self.config.precision.as_str()),
            ])
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if let Some(token) = &client.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }
        let response = request.send().await.map_err(|err| err.to_string())?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(format!("{}: {}", status.as_u16(), body.trim()))
    }

    async fn write_events(&self, ctx: &dyn AppFunctionContext, events: &[Event]) -> Result<(), SenderError> {
        let client = self.client(ctx).await?;
        let points = to_points(&self.config, events).map_err(SenderError::UnsupportedData)?;
        if points.is_empty() {
            return Ok(());
        }
        let body = points
            .iter()
            .map(|point| point.to_line(self.config.precision))
            .collect::<Vec<_>>()
            .join("\n");

        if let Err(err) = self.write_lines(&client, body).await {
            let action = if self.persist_on_error {
                let retry = serde_json::to_vec(events).map_err(|err| {
                    SenderError::Other(format!("failed to marshal the retry data, error: {err}"))
                })?;
                ctx.set_retry_data(retry);
                "persisting Events for later retry"
            } else {
                "drop event"
            };
            return Err(SenderError::Transport(format!(
                "failed to write points to influxdb, {action}. Error: {err}"
            )));
        }
        tracing::debug!(
            pipeline_id = ctx.pipeline_id(),
            correlation_id = ctx.correlation_id(),
            points = points.len(),
            "wrote points to InfluxDB"
        );
        Ok(())
    }
}

#[async_trait]
impl Sender for InfluxDbWriter {
    fn name(&self) -> &str {
        INFLUXDB_SYNC_WRITE
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        let events = events_from_data(&data)
            .map_err(|err| SenderError::UnsupportedData(err.to_string()))?;
        if let Err(err) = self.write_events(ctx, &events).await {
            tracing::error!(
                pipeline_id = ctx.pipeline_id(),
                correlation_id = ctx.correlation_id(),
                error = %err,
                "InfluxDB write failed"
            );
            return Err(err);
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        let mut event = Event::new("profile", "device 1", "source");
        event.origin = 1_581_420_776_817;
        event.add_simple_reading("temperature", "Float64", "21.5");
        event.add_simple_reading("count", "Int32", "7");
        event.readings[1].origin = 0;
        event
    }

    #[test]
    fn pads_timestamps_to_nanoseconds() {
        assert_eq!(to_nanoseconds(1_581_420_776_817), 1_581_420_776_817_000_000);
        assert_eq!(to_nanoseconds(1_581_420_776), 1_581_420_776_000_000_000);
        assert_eq!(to_nanoseconds(1_581_420_776_817_123_456), 1_581_420_776_817_123_456);
        assert_eq!(to_nanoseconds(0), 0);
    }

    #[test]
    fn drops_mismatched_value_types() {
        let config = InfluxDbWriterConfig::new("http://localhost:8086");
        let points = to_points(&config, &[event()]).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(
            points[0].to_line(Precision::Microseconds),
            "readings,deviceName=device\\ 1,resourceName=temperature value=21.5 1581420776817000"
        );
    }

    #[test]
    fn templated_field_key_keeps_every_reading() {
        let mut config = InfluxDbWriterConfig::new("http://localhost:8086");
        config.field_key_pattern = "{resourceName}_{valueType}".to_string();
        let points = to_points(&config, &[event()]).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(
            points[1].to_line(Precision::Milliseconds),
            "readings,deviceName=device\\ 1,resourceName=count count_Int32=7i 1581420776817"
        );
    }

    #[test]
    fn tags_and_strings_are_escaped() {
        let mut config = InfluxDbWriterConfig::new("http://localhost:8086");
        config.value_type = InfluxValueType::String;
        config.store_event_tags = true;
        config.store_reading_tags = true;
        let mut event = Event::new("p", "d", "s");
        event.origin = 1_000_000_000_000_000_000;
        event.tags.insert("site".to_string(), json!("a,b"));
        event.tags.insert("empty".to_string(), json!(""));
        event.add_simple_reading("note", "String", "say \"hi\"");
        event.readings[0].tags.insert("floor".to_string(), json!(3));

        let points = to_points(&config, &[event]).unwrap();
        assert_eq!(
            points[0].to_line(Precision::Seconds),
            "readings,deviceName=d,floor=3,resourceName=note,site=a\\,b value=\"say \\\"hi\\\"\" 1000000000"
        );
    }

    #[test]
    fn unparsable_value_fails() {
        let mut config = InfluxDbWriterConfig::new("http://localhost:8086");
        config.value_type = InfluxValueType::Integer;
        let mut event = Event::new("p", "d", "s");
        event.add_simple_reading("count", "Int8", "300");
        assert!(to_points(&config, &[event]).is_err());
    }

    #[test]
    fn float32_keeps_short_form() {
        let config = InfluxDbWriterConfig::new("http://localhost:8086");
        let mut event = Event::new("p", "d", "s");
        event.origin = 1;
        event.add_simple_reading("t", "Float32", "21.1");
        let line = to_points(&config, &[event]).unwrap()[0].to_line(Precision::Nanoseconds);
        assert!(line.contains(" value=21.1 "), "{line}");
    }

    #[test]
    fn config_parsers() {
        assert_eq!(Precision::parse("MS"), Some(Precision::Milliseconds));
        assert_eq!(Precision::parse("m"), None);
        assert_eq!(InfluxValueType::parse("UInteger"), Some(InfluxValueType::UInteger));
        assert!(InfluxValueType::Boolean.accepts("Bool"));
        assert!(InfluxValueType::String.accepts("Binary"));
        assert!(!InfluxValueType::Float.accepts("Int64"));
    }

    #[test]
    fn token_mode_requires_secret_path() {
        let mut config = InfluxDbWriterConfig::new("http://localhost:8086");
        config.auth_mode = InfluxAuthMode::Token;
        assert_eq!(
            InfluxDbWriter::new(config, false).err(),
            Some(ConfigError::Missing("secretpath".to_string()))
        );
    }
}
