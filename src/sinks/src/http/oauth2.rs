//! OAuth2 client-credentials token source with expiry-aware caching.

use serde::Deserialize;
use std::time::{Duration, Instant};

/// Tokens are refreshed this long before they expire.
const EXPIRY_DELTA: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub endpoint_params: Vec<(String, String)>,
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("oauth2: token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oauth2: cannot fetch token: {status}\nResponse: {body}")]
    Status { status: u16, body: String },
    #[error("oauth2: server response missing access_token")]
    MissingToken,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    header: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + EXPIRY_DELTA < at,
            None => true,
        }
    }
}

pub struct TokenSource {
    http: reqwest::Client,
    credentials: ClientCredentials,
    cached: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, credentials: ClientCredentials) -> Self {
        Self {
            http,
            credentials,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Value for the `Authorization` header, fetching a new token when needed.
    pub async fn authorization(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|token| token.is_valid()) {
            return Ok(token.header.clone());
        }
        let token = self.fetch().await?;
        let header = token.header.clone();
        *cached = Some(token);
        Ok(header)
    }

    async fn fetch(&self) -> Result<CachedToken, TokenError> {
        let mut form = vec![("grant_type".to_string(), "client_credentials".to_string())];
        if !self.credentials.scopes.is_empty() {
            form.push(("scope".to_string(), self.credentials.scopes.join(" ")));
        }
        form.extend(self.credentials.endpoint_params.iter().cloned());

        let response = self
            .http
            .post(&self.credentials.token_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response.json().await?;
        if token.access_token.is_empty() {
            return Err(TokenError::MissingToken);
        }
        let token_type = if token.token_type.is_empty() || token.token_type.eq_ignore_ascii_case("bearer") {
            "Bearer".to_string()
        } else {
            token.token_type
        };
        tracing::debug!(token_url = %self.credentials.token_url, "fetched oauth2 token");
        Ok(CachedToken {
            header: format!("{token_type} {}", token.access_token),
            expires_at: token
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }
}
