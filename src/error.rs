// =============================================================================
// Fetch Errors — Typed failures for provider calls
// =============================================================================
//
// Every provider call settles into either a payload or a `FetchError`. The
// fetchers convert the error into a human-readable message on their request
// state; the REST layer maps the error kind onto an HTTP status.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Failure of a single market-data request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// A provider credential is absent. Raised before any request is built.
    #[error("{provider} API key not configured (set {env_var})")]
    MissingCredential {
        provider: &'static str,
        env_var: &'static str,
    },

    /// Request parameters were rejected locally.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection, DNS, TLS or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// Non-2xx HTTP status.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// 2xx response carrying a provider error envelope.
    #[error("{0}")]
    Provider(String),

    /// Body could not be decoded into the endpoint's shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Coarse error category exposed to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Malformed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Malformed => "malformed",
        }
    }
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredential { .. } | Self::InvalidRequest(_) => ErrorKind::Configuration,
            Self::Network(_) | Self::Status { .. } => ErrorKind::Transport,
            Self::Provider(_) => ErrorKind::Protocol,
            Self::Malformed(_) => ErrorKind::Malformed,
        }
    }

    /// `true` when the error was detected locally and no request was sent.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential { .. } | Self::InvalidRequest(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                message: format!("HTTP error! status: {status}"),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}
