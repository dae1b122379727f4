//! Low-level MQTT client abstraction and its `rumqttc` implementation.

use super::connection_lost::ConnectionLostHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

pub type MqttClientHandle = Arc<dyn MqttClient>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MqttClientError {
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Connect(String),
    #[error("{0}")]
    Publish(String),
}

/// Connection settings a client was built with.
#[derive(Debug, Clone)]
pub struct MqttClientOptions {
    pub broker_address: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<Arc<ClientConfig>>,
    pub auto_reconnect: bool,
    pub keep_alive: Duration,
}

impl MqttClientOptions {
    pub fn new(broker_address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            tls: None,
            auto_reconnect: false,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// An unconnected-or-connected MQTT session.
#[async_trait]
pub trait MqttClient: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn connect(&self, wait: Duration) -> Result<(), MqttClientError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<(), MqttClientError>;

    /// Disconnects without waiting for in-flight messages.
    fn disconnect(&self);

    fn options(&self) -> &MqttClientOptions;
}

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// [`MqttClient`] backed by `rumqttc`.
pub struct RumqttClient {
    options: MqttClientOptions,
    on_connection_lost: Option<ConnectionLostHandler>,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

impl RumqttClient {
    pub fn new(options: MqttClientOptions, on_connection_lost: Option<ConnectionLostHandler>) -> Self {
        Self {
            options,
            on_connection_lost,
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    fn spawn_event_loop(
        &self,
        mut event_loop: EventLoop,
        ready: oneshot::Sender<Result<(), String>>,
    ) -> JoinHandle<()> {
        let connected = Arc::clone(&self.connected);
        let handler = self.on_connection_lost.clone();
        let auto_reconnect = self.options.auto_reconnect;
        let servers = vec![self.options.broker_address.clone()];
        let client_id = self.options.client_id.clone();

        tokio::spawn(async move {
            let mut ready = Some(ready);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::Release);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Ok(()));
                        } else {
                            tracing::info!(client_id = %client_id, "MQTT connection re-established");
                        }
                    }
                    Ok(_) => {}
                    Err(ConnectionError::RequestsDone) => {
                        connected.store(false, Ordering::Release);
                        break;
                    }
                    Err(err) => {
                        let was_connected = connected.swap(false, Ordering::AcqRel);
                        if let Some(tx) = ready.take() {
                            let _ = tx.send(Err(err.to_string()));
                            break;
                        }
                        if was_connected {
                            if let Some(handler) = handler.as_ref() {
                                handler.handle(&servers, &client_id, &err.to_string());
                            }
                        }
                        if !auto_reconnect {
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl MqttClient for RumqttClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn connect(&self, wait: Duration) -> Result<(), MqttClientError> {
        let options = build_mqtt_options(&self.options).map_err(MqttClientError::Connect)?;
        let (client, event_loop) = AsyncClient::new(options, 64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = self.spawn_event_loop(event_loop, ready_tx);

        if let Some(previous) = self.session.lock().replace(Session {
            client,
            event_loop: handle,
        }) {
            previous.event_loop.abort();
        }

        let outcome = match tokio::time::timeout(wait, ready_rx).await {
            Err(_) => Err(MqttClientError::Timeout),
            Ok(Err(_)) => Err(MqttClientError::Connect(
                "event loop stopped before the broker acknowledged the connection".to_string(),
            )),
            Ok(Ok(result)) => result.map_err(MqttClientError::Connect),
        };
        if outcome.is_err() {
            if let Some(session) = self.session.lock().take() {
                session.event_loop.abort();
            }
        }
        outcome
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<(), MqttClientError> {
        let client = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or_else(|| MqttClientError::Publish("client is not connected".to_string()))?;

        match tokio::time::timeout(wait, client.publish(topic, qos, retain, payload)).await {
            Err(_) => Err(MqttClientError::Timeout),
            Ok(Err(err)) => Err(MqttClientError::Publish(err.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(session) = self.session.lock().take() {
            let _ = session.client.try_disconnect();
            session.event_loop.abort();
        }
    }

    fn options(&self) -> &MqttClientOptions {
        &self.options
    }
}

impl Drop for RumqttClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.event_loop.abort();
        }
    }
}

fn normalize_broker_url(url: &str) -> String {
    if url.contains("://") {
        url.to_owned()
    } else {
        format!("tcp://{url}")
    }
}

pub(crate) fn build_mqtt_options(config: &MqttClientOptions) -> Result<MqttOptions, String> {
    let endpoint = Url::parse(&normalize_broker_url(&config.broker_address))
        .map_err(|err| format!("invalid broker URL `{}`: {err}", config.broker_address))?;

    let scheme = endpoint.scheme();
    if default_port_for_scheme(scheme).is_none() {
        return Err(format!(
            "unsupported broker URL scheme `{scheme}` in `{}`",
            config.broker_address
        ));
    }

    let host = endpoint
        .host_str()
        .ok_or_else(|| format!("broker URL `{}` missing host", config.broker_address))?;

    let port = endpoint
        .port()
        .or_else(|| default_port_for_scheme(scheme))
        .ok_or_else(|| format!("broker URL `{}` missing port", config.broker_address))?;

    let client_id = match config.client_id.trim() {
        "" => uuid::Uuid::new_v4().to_string(),
        id => id.to_string(),
    };

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(config.keep_alive);
    if let Some(username) = config.username.as_deref() {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    if is_tls_scheme(scheme) {
        let transport = match config.tls.as_ref() {
            Some(tls) => Transport::tls_with_config(TlsConfiguration::Rustls(Arc::clone(tls))),
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }

    Ok(options)
}

pub(crate) fn map_qos(qos: u8) -> Result<QoS, String> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(format!("unsupported MQTT QoS level: {other}")),
    }
}

fn default_port_for_scheme(scheme: &str) -> Option<u16> {
    match scheme {
        "mqtt" | "tcp" => Some(1883),
        "mqtts" | "ssl" | "tcps" | "tls" => Some(8883),
        _ => None,
    }
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl" | "tcps" | "tls")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_without_scheme_defaults_to_tcp() {
        let options =
            build_mqtt_options(&MqttClientOptions::new("localhost:1884", "edge")).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1884));
        assert_eq!(options.client_id(), "edge");
    }

    #[test]
    fn tls_scheme_uses_default_port() {
        let options =
            build_mqtt_options(&MqttClientOptions::new("ssl://broker.example.com", "edge")).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err =
            build_mqtt_options(&MqttClientOptions::new("aaa://unreachable:1111", "edge")).unwrap_err();
        assert!(err.contains("unsupported broker URL scheme"));
    }

    #[test]
    fn empty_client_id_is_generated() {
        let options = build_mqtt_options(&MqttClientOptions::new("tcp://localhost:1883", "")).unwrap();
        assert!(!options.client_id().is_empty());
    }

    #[test]
    fn qos_mapping() {
        assert_eq!(map_qos(1).unwrap(), QoS::AtLeastOnce);
        assert!(map_qos(3).unwrap_err().contains("unsupported MQTT QoS level"));
    }

    #[tokio::test]
    async fn connect_with_bad_scheme_fails_fast() {
        let client = RumqttClient::new(MqttClientOptions::new("aaa://unreachable:1111", "edge"), None);
        let err = client.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, MqttClientError::Connect(_)));
        assert!(!client.is_connected());
    }
}
