//! Top-level error type for transport operations
//!
//! Callers of `open`/`close`/`receive` get a [`TransportError`]; the typed,
//! retryability-annotated [`ConnectionStatusError`] taxonomy reaches them
//! separately through listener callbacks. Configuration problems are fatal
//! and surface at construction time only.

use crate::config::ConfigError;
use crate::transport::error::ConnectionStatusError;
use crate::transport::State;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced to the direct caller of a transport operation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("connection is {state:?}; call open() first")]
    NotOpen { state: State },

    #[error("timed out after {0:?} waiting for the connection to open")]
    OpenTimeout(Duration),

    #[error("timed out after {0:?} waiting for the connection to close")]
    CloseTimeout(Duration),

    #[error("protocol engine failure: {0}")]
    Engine(String),

    #[error("websockets are not supported with X.509 authentication")]
    WebsocketWithX509,

    #[error("failed to open connection: {0}")]
    OpenFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("connection failure")]
    Status(#[from] ConnectionStatusError),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

impl TransportError {
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }

    pub fn open_failed(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::OpenFailed(Box::new(cause))
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
