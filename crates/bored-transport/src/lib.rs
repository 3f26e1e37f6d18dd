//! Broker transport for the reverse-tunnel agent
//!
//! The agent keeps one outbound WebSocket connection to the broker and
//! carries many logical byte streams over it.
//!
//! # Features
//!
//! - **Outbound only**: the agent dials `ws(s)://.../agent/connect`, presenting
//!   a bearer token and its public key
//! - **Multiplexing**: framed logical streams over the single WebSocket
//! - **Flow control**: per-stream credit windows, so one slow stream never
//!   stalls the others
//! - **Roles**: the agent runs the server role (accepts streams); the client
//!   role (opens streams) exists for brokers and tests

pub mod connection;
pub mod connector;
pub mod stream;

pub use connection::{ConnectionStats, Multiplexer, Role};
pub use connector::{
    ensure_crypto_provider, BrokerConnector, BrokerCredentials, DEFAULT_CONNECT_TIMEOUT,
};
pub use stream::{MuxRecvHalf, MuxSendHalf, MuxStream};

use std::time::Duration;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Broker connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Broker rejected connect handshake with HTTP {0}")]
    HandshakeRejected(u16),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream reset")]
    StreamReset,

    #[error("Stream closed")]
    StreamClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;

        match err {
            Error::Http(response) => TransportError::HandshakeRejected(response.status().as_u16()),
            Error::ConnectionClosed | Error::AlreadyClosed => TransportError::ConnectionClosed,
            Error::Io(e) => TransportError::IoError(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
