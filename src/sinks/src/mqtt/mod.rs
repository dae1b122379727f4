//! MQTT export: generic brokers, AWS IoT Core, Azure IoT Hub and IBM Watson.

pub mod base;
pub mod client;
pub mod connection_lost;
pub mod factory;
pub mod sender;
pub mod shared;

pub use base::{BaseMqttSender, PublishSettings, WAIT_DURATION};
pub use client::{MqttClient, MqttClientError, MqttClientHandle, MqttClientOptions, RumqttClient};
pub use connection_lost::ConnectionLostHandler;
pub use factory::{
    AuthMode, AwsIotCoreClientFactory, AzureIotHubClientFactory, BrokerSettings,
    MqttClientFactory, RegularClientFactory, WatsonClientFactory,
};
pub use sender::{
    AwsExportMode, AwsIotCoreSender, AzureExportMode, AzureIotHubSender, MqttSender, MQTT_EXPORT,
};
pub use shared::{SharedClientHolder, SharedMqttClient};
pub use rumqttc::QoS;
