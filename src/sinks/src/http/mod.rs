//! HTTP export with optional header-secret, OAuth2, client-certificate or SigV4 auth.

pub mod oauth2;
pub mod sigv4;

use crate::context::AppFunctionContext;
use crate::data::PipelineData;
use crate::error::{ConfigError, SenderError};
use crate::secrets::{non_empty, SecretData};
use crate::sender::{coerce, require_data, Sender};
use crate::tls::RenegotiationSupport;
use async_trait::async_trait;
use oauth2::{ClientCredentials, TokenSource};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use sigv4::{AwsCredentials, AwsSignerConfig};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

pub const HTTP_EXPORT: &str = "XpertHTTPExport";
pub const HTTP_EXPORT_SIZE: &str = "HttpExportSize";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SECRET_CA_CERT: &str = "cacert";
const SECRET_CLIENT_KEY: &str = "clientkey";
const SECRET_CLIENT_CERT: &str = "clientcert";
const SECRET_OAUTH_CLIENT_ID: &str = "client_id";
const SECRET_OAUTH_CLIENT_SECRET: &str = "client_secret";
const SECRET_OAUTH_TOKEN_URL: &str = "token_url";
const SECRET_OAUTH_SCOPES: &str = "token_scopes";
const SECRET_OAUTH_TOKEN_CERT: &str = "token_cert";
const SECRET_AWS_ACCESS_KEY: &str = "aws_access_key";
const SECRET_AWS_SECRET_KEY: &str = "aws_secret_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpAuthMode {
    #[default]
    None,
    HeaderSecret,
    OAuth2ClientCredentials,
    ClientCert,
    AwsSignature,
}

impl HttpAuthMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Some(Self::None),
            "header_secret" => Some(Self::HeaderSecret),
            "oauth2_clientcredentials" => Some(Self::OAuth2ClientCredentials),
            "clientcert" => Some(Self::ClientCert),
            "aws_signature" => Some(Self::AwsSignature),
            _ => None,
        }
    }
}

/// What a failed send does with the pipeline and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorPolicy {
    /// Halt the pipeline and drop the payload.
    FailFast,
    /// Halt the pipeline and stage the payload for store-and-forward.
    PersistAndStop,
    /// Log the failure and hand the input to the next stage.
    ContinueWithInputData,
}

impl SendErrorPolicy {
    pub fn from_flags(
        persist_on_error: bool,
        continue_on_send_error: bool,
        return_input_data: bool,
    ) -> Result<Self, ConfigError> {
        match (persist_on_error, continue_on_send_error, return_input_data) {
            (true, true, _) => Err(ConfigError::Invalid(
                "persistOnError & continueOnSendError can not both be set to true".to_string(),
            )),
            (_, true, false) => Err(ConfigError::Invalid(
                "continueOnSendError can only be used in conjunction with returnInputData"
                    .to_string(),
            )),
            (_, true, true) => Ok(Self::ContinueWithInputData),
            (true, false, _) => Ok(Self::PersistAndStop),
            (false, false, _) => Ok(Self::FailFast),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    pub url: String,
    pub mime_type: String,
    pub method: Method,
    pub persist_on_error: bool,
    pub continue_on_send_error: bool,
    pub return_input_data: bool,
    pub auth_mode: HttpAuthMode,
    pub header_name: String,
    pub secret_path: String,
    pub secret_name: String,
    pub skip_verify: bool,
    pub renegotiation: RenegotiationSupport,
    pub request_headers: BTreeMap<String, String>,
    pub aws_signer: Option<AwsSignerConfig>,
}

impl HttpSenderConfig {
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>, method: Method) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
            method,
            persist_on_error: false,
            continue_on_send_error: false,
            return_input_data: false,
            auth_mode: HttpAuthMode::None,
            header_name: String::new(),
            secret_path: String::new(),
            secret_name: String::new(),
            skip_verify: false,
            renegotiation: RenegotiationSupport::Never,
            request_headers: BTreeMap::new(),
            aws_signer: None,
        }
    }

    fn validate(&self) -> Result<SendErrorPolicy, ConfigError> {
        let policy = SendErrorPolicy::from_flags(
            self.persist_on_error,
            self.continue_on_send_error,
            self.return_input_data,
        )?;
        let missing = |name: &str, value: &str| {
            if value.trim().is_empty() {
                Err(ConfigError::Missing(name.to_string()))
            } else {
                Ok(())
            }
        };
        missing("url", &self.url)?;
        missing("mimetype", &self.mime_type)?;
        match self.auth_mode {
            HttpAuthMode::None => {}
            HttpAuthMode::HeaderSecret => {
                missing("headername", &self.header_name)?;
                missing("secretpath", &self.secret_path)?;
                missing("secretname", &self.secret_name)?;
            }
            HttpAuthMode::OAuth2ClientCredentials | HttpAuthMode::ClientCert => {
                missing("secretpath", &self.secret_path)?;
            }
            HttpAuthMode::AwsSignature => {
                missing("secretpath", &self.secret_path)?;
                let signer = self
                    .aws_signer
                    .as_ref()
                    .ok_or_else(|| ConfigError::Missing("awsv4signerconfigs".to_string()))?;
                missing("awsv4signerconfigs.region", &signer.region)?;
                missing("awsv4signerconfigs.service", &signer.service)?;
            }
        }
        Ok(policy)
    }
}

enum PreparedAuth {
    None,
    Header { name: String, value: String },
    OAuth2(TokenSource),
    Aws(AwsCredentials),
}

struct PreparedClient {
    http: reqwest::Client,
    auth: PreparedAuth,
}

struct ClientState {
    client: Option<Arc<PreparedClient>>,
    secrets_last_retrieved: OffsetDateTime,
}

pub struct HttpSender {
    config: HttpSenderConfig,
    policy: SendErrorPolicy,
    state: tokio::sync::Mutex<ClientState>,
}

fn credentials_error(message: impl Into<String>) -> SenderError {
    SenderError::Credentials(message.into())
}

impl HttpSender {
    pub fn new(config: HttpSenderConfig) -> Result<Self, ConfigError> {
        let policy = config.validate()?;
        Ok(Self {
            config,
            policy,
            state: tokio::sync::Mutex::new(ClientState {
                client: None,
                secrets_last_retrieved: OffsetDateTime::UNIX_EPOCH,
            }),
        })
    }

    pub fn policy(&self) -> SendErrorPolicy {
        self.policy
    }

    async fn initialize(&self, ctx: &dyn AppFunctionContext) -> Result<Arc<PreparedClient>, SenderError> {
        let mut state = self.state.lock().await;
        if state.secrets_last_retrieved >= ctx.secrets_last_updated() {
            if let Some(client) = state.client.as_ref() {
                return Ok(Arc::clone(client));
            }
        }

        let secrets = if self.config.secret_path.trim().is_empty() {
            SecretData::new()
        } else {
            ctx.get_secret(&self.config.secret_path).await?
        };
        let client = Arc::new(self.build_client(&secrets)?);
        state.client = Some(Arc::clone(&client));
        state.secrets_last_retrieved = OffsetDateTime::now_utc();
        tracing::debug!(
            pipeline_id = ctx.pipeline_id(),
            auth_mode = ?self.config.auth_mode,
            "initialized HTTP export client"
        );
        Ok(client)
    }

    fn build_client(&self, secrets: &SecretData) -> Result<PreparedClient, SenderError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .danger_accept_invalid_certs(self.config.skip_verify);
        if self.config.renegotiation != RenegotiationSupport::Never {
            tracing::debug!(
                policy = ?self.config.renegotiation,
                "TLS renegotiation requested; rustls does not renegotiate"
            );
        }
        if let Some(ca) = non_empty(secrets, SECRET_CA_CERT) {
            builder = add_roots(builder, ca, "cacert")?;
        }

        let auth = match self.config.auth_mode {
            HttpAuthMode::None => PreparedAuth::None,
            HttpAuthMode::HeaderSecret => {
                let value = non_empty(secrets, &self.config.secret_name).ok_or_else(|| {
                    credentials_error(format!(
                        "secret `{}` not found at secret path `{}`",
                        self.config.secret_name, self.config.secret_path
                    ))
                })?;
                PreparedAuth::Header {
                    name: self.config.header_name.clone(),
                    value: value.to_string(),
                }
            }
            HttpAuthMode::ClientCert => {
                let (Some(key), Some(cert)) = (
                    non_empty(secrets, SECRET_CLIENT_KEY),
                    non_empty(secrets, SECRET_CLIENT_CERT),
                ) else {
                    return Err(credentials_error(
                        "AuthMode:clientcert selected however the key or cert PEM block was not found at secret path",
                    ));
                };
                let identity = reqwest::Identity::from_pem(format!("{cert}\n{key}").as_bytes())
                    .map_err(|err| credentials_error(format!("invalid client certificate: {err}")))?;
                builder = builder.identity(identity);
                PreparedAuth::None
            }
            HttpAuthMode::AwsSignature => {
                let (Some(access_key), Some(secret_key)) = (
                    non_empty(secrets, SECRET_AWS_ACCESS_KEY),
                    non_empty(secrets, SECRET_AWS_SECRET_KEY),
                ) else {
                    return Err(credentials_error(
                        "aws_access_key and aws_secret_key must be present and non-empty at secret path",
                    ));
                };
                PreparedAuth::Aws(AwsCredentials {
                    access_key: access_key.to_string(),
                    secret_key: secret_key.to_string(),
                })
            }
            HttpAuthMode::OAuth2ClientCredentials => {
                let credentials = oauth_credentials(secrets)?;
                if let Some(token_cert) = non_empty(secrets, SECRET_OAUTH_TOKEN_CERT) {
                    builder = add_roots(builder, token_cert, "token_cert")?;
                }
                let http = builder
                    .build()
                    .map_err(|err| credentials_error(format!("failed to build HTTP client: {err}")))?;
                return Ok(PreparedClient {
                    auth: PreparedAuth::OAuth2(TokenSource::new(http.clone(), credentials)),
                    http,
                });
            }
        };

        let http = builder
            .build()
            .map_err(|err| credentials_error(format!("failed to build HTTP client: {err}")))?;
        Ok(PreparedClient { http, auth })
    }

    async fn deliver(
        &self,
        ctx: &dyn AppFunctionContext,
        client: &PreparedClient,
        url: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, SenderError> {
        let method = &self.config.method;
        let mut request = client
            .http
            .request(method.clone(), url)
            .header(CONTENT_TYPE, &self.config.mime_type);

        match &client.auth {
            PreparedAuth::None => {}
            PreparedAuth::Header { name, value } => {
                request = request.header(name.as_str(), value.as_str());
            }
            PreparedAuth::OAuth2(source) => {
                let authorization = source.authorization().await.map_err(|err| {
                    SenderError::Transport(format!("failed to obtain oauth2 token: {err}"))
                })?;
                request = request.header(reqwest::header::AUTHORIZATION, authorization);
            }
            PreparedAuth::Aws(credentials) => {
                let signer = self.config.aws_signer.as_ref().ok_or_else(|| {
                    SenderError::Other("aws_signature auth requires awsv4signerconfigs".to_string())
                })?;
                let parsed = url::Url::parse(url)
                    .map_err(|err| SenderError::Other(format!("invalid URL `{url}`: {err}")))?;
                let covered = vec![(CONTENT_TYPE.as_str().to_string(), self.config.mime_type.clone())];
                let headers = sigv4::sign(
                    method.as_str(),
                    &parsed,
                    &covered,
                    payload,
                    credentials,
                    signer,
                    OffsetDateTime::now_utc(),
                )
                .map_err(|err| SenderError::Other(format!("failed to sign request: {err}")))?;
                for (name, value) in headers {
                    request = request.header(name, value);
                }
            }
        }
        for (name, value) in &self.config.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(payload.to_vec()).send().await.map_err(|err| {
            SenderError::Transport(format!(
                "failed to send {method} request to {url} in pipeline '{}': {err}",
                ctx.pipeline_id()
            ))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SenderError::Transport(format!(
                "{HTTP_EXPORT} received {} HTTP response status code after sending {method} request to {url} in pipeline '{}'",
                status.as_u16(),
                ctx.pipeline_id()
            )));
        }
        let body = response.bytes().await.map_err(|err| {
            SenderError::Transport(format!("failed to read response body from {url}: {err}"))
        })?;
        Ok(body.to_vec())
    }

    fn record_export_size(&self, ctx: &dyn AppFunctionContext, size: usize) {
        let Some(metrics) = ctx.metrics_manager() else {
            return;
        };
        let mut tags = BTreeMap::new();
        tags.insert("destination".to_string(), self.config.url.clone());
        match metrics.histogram(
            HTTP_EXPORT_SIZE,
            "Size in bytes of data exported over HTTP",
            &tags,
        ) {
            Ok(histogram) => histogram.observe(size as f64),
            Err(err) => tracing::warn!(
                metric = HTTP_EXPORT_SIZE,
                error = %err,
                "Unable to register metric, collection will not be reported"
            ),
        }
    }
}

fn add_roots(
    mut builder: reqwest::ClientBuilder,
    pem: &str,
    label: &str,
) -> Result<reqwest::ClientBuilder, SenderError> {
    let certs = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
        .map_err(|err| credentials_error(format!("failed to parse {label} PEM: {err}")))?;
    if certs.is_empty() {
        return Err(credentials_error(format!("{label} PEM block is empty")));
    }
    for cert in certs {
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

fn oauth_credentials(secrets: &SecretData) -> Result<ClientCredentials, SenderError> {
    let required = |key: &str| {
        non_empty(secrets, key)
            .map(str::to_string)
            .ok_or_else(|| credentials_error(format!("oauth2 secret `{key}` not found at secret path")))
    };
    let reserved: HashSet<&str> = [
        SECRET_OAUTH_CLIENT_ID,
        SECRET_OAUTH_CLIENT_SECRET,
        SECRET_OAUTH_TOKEN_URL,
        SECRET_OAUTH_SCOPES,
        SECRET_OAUTH_TOKEN_CERT,
        SECRET_CA_CERT,
    ]
    .into_iter()
    .collect();

    let mut endpoint_params: Vec<(String, String)> = secrets
        .iter()
        .filter(|(key, _)| !reserved.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    endpoint_params.sort();

    Ok(ClientCredentials {
        client_id: required(SECRET_OAUTH_CLIENT_ID)?,
        client_secret: required(SECRET_OAUTH_CLIENT_SECRET)?,
        token_url: required(SECRET_OAUTH_TOKEN_URL)?,
        scopes: non_empty(secrets, SECRET_OAUTH_SCOPES)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|scope| !scope.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        endpoint_params,
    })
}

#[async_trait]
impl Sender for HttpSender {
    fn name(&self) -> &str {
        HTTP_EXPORT
    }

    async fn send(
        &self,
        ctx: &dyn AppFunctionContext,
        data: Option<PipelineData>,
    ) -> Result<PipelineData, SenderError> {
        let data = require_data(self.name(), ctx, data)?;
        let payload = coerce(self.name(), &data)?;
        let client = self.initialize(ctx).await?;
        let url = ctx.apply_values(&self.config.url)?;

        match self.deliver(ctx, &client, &url, &payload).await {
            Ok(body) => {
                tracing::debug!(
                    pipeline_id = ctx.pipeline_id(),
                    correlation_id = ctx.correlation_id(),
                    url = %url,
                    bytes = payload.len(),
                    "sent data via HTTP"
                );
                self.record_export_size(ctx, payload.len());
                if self.config.return_input_data {
                    Ok(data)
                } else {
                    Ok(PipelineData::Bytes(body))
                }
            }
            Err(err) => match self.policy {
                SendErrorPolicy::ContinueWithInputData => {
                    tracing::warn!(
                        pipeline_id = ctx.pipeline_id(),
                        correlation_id = ctx.correlation_id(),
                        error = %err,
                        "HTTP export failed, continuing pipeline with input data"
                    );
                    Ok(data)
                }
                SendErrorPolicy::PersistAndStop => {
                    ctx.set_retry_data(payload);
                    tracing::error!(
                        pipeline_id = ctx.pipeline_id(),
                        correlation_id = ctx.correlation_id(),
                        error = %err,
                        "HTTP export failed, persisting data for later retry"
                    );
                    Err(err)
                }
                SendErrorPolicy::FailFast => {
                    tracing::error!(
                        pipeline_id = ctx.pipeline_id(),
                        correlation_id = ctx.correlation_id(),
                        error = %err,
                        "HTTP export failed"
                    );
                    Err(err)
                }
            },
        }
    }
}
