use crate::context::TemplateError;
use crate::secrets::SecretError;

/// Errors surfaced while building a sender from its parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("mandatory parameter `{0}` not found")]
    Missing(String),
    #[error("invalid value `{value}` for parameter `{name}`: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid_value(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by a send/write call. The pipeline halts on any of these.
#[derive(thiserror::Error, Debug)]
pub enum SenderError {
    /// The stage was invoked without input.
    #[error("{0}")]
    NoData(String),
    /// The input could not be interpreted by this sender.
    #[error("{0}")]
    UnsupportedData(String),
    #[error(transparent)]
    Secret(#[from] SecretError),
    /// Missing or malformed credentials material.
    #[error("{0}")]
    Credentials(String),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("{0}")]
    Connection(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Transport(String),
    #[error("{0}")]
    Other(String),
}

impl SenderError {
    /// Transient failures are the only ones staged for store-and-forward.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SenderError::Connection(_) | SenderError::Timeout(_) | SenderError::Transport(_)
        )
    }
}
