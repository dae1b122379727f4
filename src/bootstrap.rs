//! Service start-up: CLI flags, config loading, logging, and the shared resources
//! every sender context is built from.

use crate::config::AppConfig;
use crate::logging::LoggingGuard;
use crate::runner::{ExportRunner, RetryStore};
use sinks::notification::HttpNotificationClient;
use sinks::{InMemorySecretProvider, SenderRegistry, ServiceResources};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry::PrometheusMetrics;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliFlags {
    pub config_path: Option<String>,
    pub input_path: Option<String>,
}

impl CliFlags {
    pub fn parse() -> Self {
        Self::from_args(std::env::args().skip(1))
    }

    pub fn from_args(args: impl IntoIterator<Item = String>) -> Self {
        let mut flags = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => flags.config_path = args.next(),
                "--input" => flags.input_path = args.next(),
                _ => {}
            }
        }
        flags
    }
}

pub struct BootstrapResult {
    pub config: AppConfig,
    pub flags: CliFlags,
    pub runner: ExportRunner,
    /// Must outlive every log call.
    pub logging_guard: LoggingGuard,
}

/// Parses the CLI, loads config, initializes logging and the metrics endpoint,
/// and builds the export runner.
pub fn default_init() -> Result<BootstrapResult, Box<dyn std::error::Error + Send + Sync>> {
    let flags = CliFlags::parse();
    let config = match flags.config_path.as_deref() {
        Some(path) => AppConfig::load_required(path)?,
        None => AppConfig::default(),
    };

    let logging_guard = crate::logging::init_logging(&config.logging)?;
    if let Some(path) = flags.config_path.as_deref() {
        tracing::info!(config_path = path, "loaded config");
    }
    start_metrics_exporter(&config)?;

    let resources = service_resources(&config)?;
    let registry = SenderRegistry::with_builtin_senders(config.external_mqtt());
    let store = config
        .retry
        .dir
        .as_deref()
        .map(RetryStore::open)
        .transpose()?;
    let runner = ExportRunner::build(&config.pipelines, &registry, resources, store)?;

    Ok(BootstrapResult {
        config,
        flags,
        runner,
        logging_guard,
    })
}

/// Resources shared by every pipeline context of this process.
pub fn service_resources(
    config: &AppConfig,
) -> Result<ServiceResources, Box<dyn std::error::Error + Send + Sync>> {
    let secrets = InMemorySecretProvider::with_secrets(config.secrets.clone());
    let mut resources = ServiceResources::new(Arc::new(secrets))
        .with_metrics(Arc::new(PrometheusMetrics::global()))
        .with_connection_waiters(config.mqtt.max_connection_waiters);
    if let Some(base_url) = config.notifications.base_url.as_deref() {
        resources = resources.with_notification_client(Arc::new(HttpNotificationClient::new(base_url)?));
    }
    Ok(resources)
}

fn start_metrics_exporter(
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(addr) = config.metrics.addr.as_deref() else {
        return Ok(());
    };
    let addr: SocketAddr = addr.parse()?;
    tracing::info!(%addr, "enabling metrics exporter");
    let exporter = prometheus_exporter::start(addr)?;
    // The endpoint lives as long as the process.
    Box::leak(Box::new(exporter));
    Ok(())
}
