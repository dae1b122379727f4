//! Export sinks for edge pipelines: MQTT (generic, AWS IoT Core, Azure IoT
//! Hub, IBM Watson), HTTP, Kafka, InfluxDB and PostgreSQL/TimescaleDB.
//!
//! Every sender builds its client lazily on first use, rebuilds it when the
//! context reports rotated secrets, and stages the failed payload for
//! store-and-forward when `persistonerror` is set.

pub mod configurable;
pub mod context;
pub mod counter;
pub mod data;
pub mod error;
pub mod http;
pub mod influxdb;
pub mod kafka;
pub mod model;
pub mod mqtt;
pub mod notification;
pub mod postgres;
pub mod registry;
pub mod secrets;
pub mod sender;
pub mod tls;

pub use configurable::{ExternalMqttConfig, Parameters};
pub use context::{AppContext, AppFunctionContext, ServiceResources};
pub use counter::BoundedCounter;
pub use data::PipelineData;
pub use error::{ConfigError, SenderError};
pub use http::{HttpSender, HttpSenderConfig, SendErrorPolicy};
pub use influxdb::InfluxDbWriter;
pub use kafka::KafkaSender;
pub use model::{Event, Reading};
pub use postgres::PostgresWriter;
pub use registry::SenderRegistry;
pub use secrets::{InMemorySecretProvider, SecretData, SecretProvider};
pub use sender::Sender;
