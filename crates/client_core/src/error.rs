use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {method} failed: {source}")]
    Transport {
        method: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} failed with status {status}: {error}")]
    Api {
        method: String,
        status: u16,
        #[source]
        error: ApiError,
    },
    #[error("unexpected response from {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("realtime connection failed: {0}")]
    Realtime(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Api { status, error, .. } => {
                error.code == ErrorCode::RateLimited || (*status >= 500 && *status != 501)
            }
            Self::Realtime(_) => true,
            Self::Decode { .. } | Self::Config(_) => false,
        }
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
