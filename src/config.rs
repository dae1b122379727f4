use serde::Deserialize;
use sinks::counter::DEFAULT_MAX_CONNECTION_WAITERS;
use sinks::{ExternalMqttConfig, Parameters, SecretData};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub mqtt: MqttServiceConfig,
    pub notifications: NotificationsConfig,
    pub retry: RetryConfig,
    /// Seed for the in-memory secret store, keyed by secret path.
    pub secrets: HashMap<String, SecretData>,
    pub pipelines: Vec<PipelineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub output: LoggingOutput,
    pub level: LogLevel,
    pub include_source: bool,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            output: LoggingOutput::Stdout,
            level: LogLevel::Info,
            include_source: true,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingOutput {
    Stdout,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub dir: String,
    pub file_name: String,
    pub rotation: LogRotationConfig,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            dir: "./logs".to_string(),
            file_name: "edge-export.log".to_string(),
            rotation: LogRotationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogRotationConfig {
    pub keep_days: u64,
    pub max_num: u64,
    pub max_size_mb: u64,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            keep_days: 7,
            max_num: 30,
            max_size_mb: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the prometheus scrape endpoint. Disabled when unset.
    pub addr: Option<String>,
}

/// Service-wide MQTT connection used by senders in shared-client mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttServiceConfig {
    #[serde(flatten)]
    pub external: ExternalMqttConfig,
    pub max_connection_waiters: u32,
}

impl Default for MqttServiceConfig {
    fn default() -> Self {
        Self {
            external: ExternalMqttConfig::default(),
            max_connection_waiters: DEFAULT_MAX_CONNECTION_WAITERS,
        }
    }
}

impl MqttServiceConfig {
    pub fn is_configured(&self) -> bool {
        !self.external.url.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Base URL of the notifications service. Disconnection alerts are skipped when unset.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Directory where payloads staged by failed sends are kept for the next run.
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub function: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl AppConfig {
    pub fn load_required(
        path: impl AsRef<Path>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("failed to read config file {}: {}", path.display(), err))?;
        let cfg: AppConfig = serde_yaml::from_str(&raw)
            .map_err(|err| format!("failed to parse yaml config {}: {}", path.display(), err))?;
        Ok(cfg)
    }

    pub fn load_optional(
        path: impl AsRef<Path>,
    ) -> Result<Option<Self>, Box<dyn std::error::Error + Send + Sync>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::load_required(path)?))
    }

    /// External MQTT settings handed to the sender registry, if a broker is configured.
    pub fn external_mqtt(&self) -> Option<ExternalMqttConfig> {
        self.mqtt
            .is_configured()
            .then(|| self.mqtt.external.clone())
    }
}
