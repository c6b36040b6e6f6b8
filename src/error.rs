use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the tracking service.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server responded with status {code}: {body}")]
    Status { code: u16, body: String },
    #[error("access token rejected; re-run `auth set-token`")]
    Unauthorized,
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Fatal errors cannot be fixed by retrying later.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

/// Failures produced by a player status adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("player unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected player response: {0}")]
    Protocol(String),
    #[error("{0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdapterError::Fatal(_))
    }
}

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("failed accessing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed serializing {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BacklogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BacklogError::Io {
            path: path.into(),
            source,
        }
    }
}
