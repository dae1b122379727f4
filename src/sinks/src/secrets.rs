//! Secret retrieval used by the client factories.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use time::OffsetDateTime;

pub type SecretData = HashMap<String, String>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("no secrets found at path `{0}`")]
    NotFound(String),
    #[error("failed to retrieve secrets at path `{path}`: {reason}")]
    Retrieval { path: String, reason: String },
}

/// Backing store for secrets, keyed by secret path.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, path: &str) -> Result<SecretData, SecretError>;

    /// Moment the most recent secret write happened.
    fn secrets_last_updated(&self) -> OffsetDateTime;
}

/// Process-local secret store seeded from configuration.
pub struct InMemorySecretProvider {
    secrets: RwLock<HashMap<String, SecretData>>,
    last_updated: RwLock<OffsetDateTime>,
}

impl InMemorySecretProvider {
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(HashMap::new()),
            last_updated: RwLock::new(OffsetDateTime::UNIX_EPOCH),
        }
    }

    pub fn with_secrets(seed: HashMap<String, SecretData>) -> Self {
        let provider = Self::new();
        *provider.secrets.write() = seed;
        provider
    }

    /// Stores (or replaces) the secrets at `path` and marks secrets as rotated.
    pub fn set_secret(&self, path: impl Into<String>, data: SecretData) {
        self.secrets.write().insert(path.into(), data);
        *self.last_updated.write() = OffsetDateTime::now_utc();
    }
}

impl Default for InMemorySecretProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretProvider for InMemorySecretProvider {
    async fn get_secret(&self, path: &str) -> Result<SecretData, SecretError> {
        self.secrets
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(path.to_string()))
    }

    fn secrets_last_updated(&self) -> OffsetDateTime {
        *self.last_updated.read()
    }
}

/// Returns the trimmed value for `key` when present and non-empty.
pub fn non_empty<'a>(secrets: &'a SecretData, key: &str) -> Option<&'a str> {
    secrets
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}
