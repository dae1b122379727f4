//! Client factories, one per MQTT destination flavour.

use super::client::{MqttClientHandle, MqttClientOptions, RumqttClient};
use super::connection_lost::ConnectionLostHandler;
use crate::context::AppFunctionContext;
use crate::error::SenderError;
use crate::secrets::{non_empty, SecretData};
use crate::tls::{build_client_config, parse_certificates, RenegotiationSupport, TlsMaterial};
use async_trait::async_trait;
use std::sync::Arc;

pub const SECRET_USERNAME: &str = "username";
pub const SECRET_PASSWORD: &str = "password";
pub const SECRET_CLIENT_KEY: &str = "clientkey";
pub const SECRET_CLIENT_CERT: &str = "clientcert";
pub const SECRET_CA_CERT: &str = "cacert";

/// Authentication scheme for a generic broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    None,
    UsernamePassword,
    ClientCert,
    CaCert,
}

impl AuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "usernamepassword" => Some(Self::UsernamePassword),
            "clientcert" => Some(Self::ClientCert),
            "cacert" => Some(Self::CaCert),
            _ => None,
        }
    }
}

/// Broker connection settings shared by every factory.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub broker_address: String,
    pub client_id: String,
    pub auth_mode: AuthMode,
    pub secret_path: String,
    pub skip_verify: bool,
    pub auto_reconnect: bool,
}

impl BrokerSettings {
    pub fn new(broker_address: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_address: broker_address.into(),
            client_id: client_id.into(),
            auth_mode: AuthMode::None,
            secret_path: String::new(),
            skip_verify: false,
            auto_reconnect: false,
        }
    }

    fn base_options(&self) -> MqttClientOptions {
        let mut options = MqttClientOptions::new(&self.broker_address, &self.client_id);
        options.auto_reconnect = self.auto_reconnect;
        options
    }

    async fn fetch_secrets(&self, ctx: &dyn AppFunctionContext) -> Result<SecretData, SenderError> {
        Ok(ctx.get_secret(&self.secret_path).await?)
    }
}

/// Produces an unconnected client from the context's secrets.
#[async_trait]
pub trait MqttClientFactory: Send + Sync {
    async fn create(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError>;
}

fn credentials_error(message: impl Into<String>) -> SenderError {
    SenderError::Credentials(message.into())
}

fn finish(
    mut options: MqttClientOptions,
    material: Option<TlsMaterial>,
    ctx: &dyn AppFunctionContext,
) -> Result<MqttClientHandle, SenderError> {
    if let Some(material) = material {
        let tls = build_client_config(&material).map_err(|err| credentials_error(err.to_string()))?;
        options.tls = Some(tls);
    }
    let handler = ConnectionLostHandler::from_context(ctx);
    Ok(Arc::new(RumqttClient::new(options, Some(handler))))
}

/// Generic broker with optional username/password, client certificate or CA.
pub struct RegularClientFactory {
    settings: BrokerSettings,
}

impl RegularClientFactory {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

pub(crate) fn validate_regular_secrets(mode: AuthMode, secrets: &SecretData) -> Result<(), SenderError> {
    match mode {
        AuthMode::None => Ok(()),
        AuthMode::UsernamePassword => {
            if non_empty(secrets, SECRET_USERNAME).is_none()
                || non_empty(secrets, SECRET_PASSWORD).is_none()
            {
                return Err(credentials_error(
                    "AuthModeUsernamePassword selected however Username or Password was not found at secret path",
                ));
            }
            Ok(())
        }
        AuthMode::ClientCert => {
            if non_empty(secrets, SECRET_CLIENT_KEY).is_none()
                || non_empty(secrets, SECRET_CLIENT_CERT).is_none()
            {
                return Err(credentials_error(
                    "AuthModeCert selected however the key or cert PEM block was not found at secret path",
                ));
            }
            Ok(())
        }
        AuthMode::CaCert => {
            if non_empty(secrets, SECRET_CA_CERT).is_none() {
                return Err(credentials_error(
                    "AuthModeCA selected however no PEM Block was found at secret path",
                ));
            }
            Ok(())
        }
    }
}

#[async_trait]
impl MqttClientFactory for RegularClientFactory {
    async fn create(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        let mut options = self.settings.base_options();
        if self.settings.auth_mode == AuthMode::None {
            let material = self.settings.skip_verify.then(|| TlsMaterial {
                skip_verify: true,
                ..TlsMaterial::default()
            });
            return finish(options, material, ctx);
        }

        let secrets = self.settings.fetch_secrets(ctx).await?;
        validate_regular_secrets(self.settings.auth_mode, &secrets)?;

        options.username = non_empty(&secrets, SECRET_USERNAME).map(str::to_string);
        options.password = non_empty(&secrets, SECRET_PASSWORD).map(str::to_string);

        let ca_pem = non_empty(&secrets, SECRET_CA_CERT).map(str::to_string);
        if let Some(ca) = ca_pem.as_deref() {
            parse_certificates("ca", ca).map_err(|_| credentials_error("Error parsing CA PEM block"))?;
        }
        let (client_cert_pem, client_key_pem) = if self.settings.auth_mode == AuthMode::ClientCert {
            (
                non_empty(&secrets, SECRET_CLIENT_CERT).map(str::to_string),
                non_empty(&secrets, SECRET_CLIENT_KEY).map(str::to_string),
            )
        } else {
            (None, None)
        };

        let material = TlsMaterial {
            ca_pem,
            client_cert_pem,
            client_key_pem,
            skip_verify: self.settings.skip_verify,
            renegotiation: RenegotiationSupport::Never,
        };
        finish(options, Some(material), ctx)
    }
}

/// AWS IoT Core: mutual TLS with a device certificate.
pub struct AwsIotCoreClientFactory {
    settings: BrokerSettings,
}

impl AwsIotCoreClientFactory {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MqttClientFactory for AwsIotCoreClientFactory {
    async fn create(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        let secrets = self.settings.fetch_secrets(ctx).await?;
        let cert = non_empty(&secrets, SECRET_CLIENT_CERT)
            .ok_or_else(|| credentials_error("cert PEM block is empty"))?;
        let key = non_empty(&secrets, SECRET_CLIENT_KEY)
            .ok_or_else(|| credentials_error("key PEM block is empty"))?;

        let material = TlsMaterial {
            ca_pem: non_empty(&secrets, SECRET_CA_CERT).map(str::to_string),
            client_cert_pem: Some(cert.to_string()),
            client_key_pem: Some(key.to_string()),
            skip_verify: self.settings.skip_verify,
            renegotiation: RenegotiationSupport::Never,
        };
        finish(self.settings.base_options(), Some(material), ctx)
    }
}

/// Azure IoT Hub: client certificate auth over MQTT 3.1.1, renegotiating once.
pub struct AzureIotHubClientFactory {
    settings: BrokerSettings,
}

impl AzureIotHubClientFactory {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MqttClientFactory for AzureIotHubClientFactory {
    async fn create(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        let secrets = self.settings.fetch_secrets(ctx).await?;
        let (Some(key), Some(cert)) = (
            non_empty(&secrets, SECRET_CLIENT_KEY),
            non_empty(&secrets, SECRET_CLIENT_CERT),
        ) else {
            return Err(credentials_error(
                "AuthMode:clientcert selected however the key or cert PEM block was not found at secret path",
            ));
        };
        let username = non_empty(&secrets, SECRET_USERNAME)
            .ok_or_else(|| credentials_error("username was not found at secret path"))?;

        let mut options = self.settings.base_options();
        options.username = Some(username.to_string());

        let material = TlsMaterial {
            ca_pem: non_empty(&secrets, SECRET_CA_CERT).map(str::to_string),
            client_cert_pem: Some(cert.to_string()),
            client_key_pem: Some(key.to_string()),
            skip_verify: self.settings.skip_verify,
            renegotiation: RenegotiationSupport::OnceAsClient,
        };
        finish(options, Some(material), ctx)
    }
}

/// IBM Watson IoT: mandatory username/password, optional CA.
pub struct WatsonClientFactory {
    settings: BrokerSettings,
}

impl WatsonClientFactory {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MqttClientFactory for WatsonClientFactory {
    async fn create(&self, ctx: &dyn AppFunctionContext) -> Result<MqttClientHandle, SenderError> {
        let secrets = self.settings.fetch_secrets(ctx).await?;
        let username = non_empty(&secrets, SECRET_USERNAME)
            .ok_or_else(|| credentials_error("mandatory username is empty"))?;
        let password = non_empty(&secrets, SECRET_PASSWORD)
            .ok_or_else(|| credentials_error("mandatory password is empty"))?;

        let mut options = self.settings.base_options();
        options.username = Some(username.to_string());
        options.password = Some(password.to_string());

        let material = TlsMaterial {
            ca_pem: non_empty(&secrets, SECRET_CA_CERT).map(str::to_string),
            skip_verify: self.settings.skip_verify,
            ..TlsMaterial::default()
        };
        finish(options, Some(material), ctx)
    }
}
