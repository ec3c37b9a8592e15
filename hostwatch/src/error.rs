//! Error taxonomy shared by the transports and the store.

use std::time::Duration;

use thiserror::Error;

use crate::types::Module;

/// Socket or request level failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} responded with HTTP {status}")]
    Status { endpoint: String, status: u16 },

    #[error("{endpoint} reported failure: {message}")]
    Api { endpoint: String, message: String },

    #[error("websocket connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Inbound frame that could not be understood. Always non-fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("invalid {module} payload: {source}")]
    Payload {
        module: Module,
        #[source]
        source: serde_json::Error,
    },

    #[error("binary frame is not UTF-8")]
    NotText,
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// One module's fetch failed after exhausting its retries.
    #[error("failed to fetch {module} data: {source}")]
    ModuleFetch {
        module: Module,
        #[source]
        source: TransportError,
    },

    /// Every module request of one poll cycle failed.
    #[error("all {0} module requests of the last poll cycle failed")]
    PollCycleFailed(usize),

    #[error("{0}")]
    ConnectionExhausted(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field} `{value}`: {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },

    #[error("unknown environment `{0}` (expected development, production or docker)")]
    UnknownEnvironment(String),
}
