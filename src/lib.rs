//! Edge export service: runs configured export pipelines (MQTT, HTTP, Kafka,
//! InfluxDB, PostgreSQL) over a payload. Senders live in the `sinks` crate and
//! metrics in `telemetry`.

pub mod bootstrap;
pub mod config;
pub mod logging;
pub mod runner;

pub use config::AppConfig;
pub use runner::{parse_input, ExportRunner, PipelineOutcome, RetryStore};
