//! Reverse-tunnel agent core
//!
//! Keeps one outbound connection to the broker alive and serves every
//! logical stream the broker opens through a [`SecureStreamPipeline`]:
//! the stream's handshake envelope yields a one-time key, the payload is
//! decrypted and relayed over TLS to the protected backend, and the
//! backend's replies are encrypted on the way back.
//!
//! # Example
//!
//! ```ignore
//! use bored_crypto::{GeneratedKeyProvider, KeyProvider};
//! use bored_tunnel::{AgentConfig, TunnelClient};
//!
//! let client = TunnelClient::new(config)?;
//! client.initialize(GeneratedKeyProvider.load()?)?;
//! client.run_until_shutdown(tokio::signal::ctrl_c()).await;
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod pipeline;
pub mod reconnect;
pub mod session_cache;

pub use backend::{BackendDialer, BackendStream};
pub use client::{ClientState, TunnelClient};
pub use config::{AgentConfig, BackendConfig, BackendVerification, ImpersonationConfig};
pub use pipeline::{PipelineContext, PipelineState, RelayStats, SecureStreamPipeline};
pub use reconnect::{Backoff, ReconnectConfig};
pub use session_cache::SessionTicketCache;

use bored_crypto::CryptoError;
use bored_impersonation::ImpersonationError;
use bored_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors that end a single logical stream
///
/// None of these affect other streams or the broker session.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Handshake failed: {0}")]
    Handshake(CryptoError),

    #[error("Stream ended before the handshake completed")]
    HandshakeIncomplete,

    #[error("Backend dial failed: {0}")]
    BackendDial(String),

    #[error("Backend TLS handshake failed: {0}")]
    BackendTls(String),

    #[error("Backend dial timed out after {0:?}")]
    BackendTimeout(Duration),

    #[error("Record error: {0}")]
    Record(CryptoError),

    #[error("Stream ended inside a record")]
    TruncatedRecord,

    #[error("Impersonation rejected request: {0}")]
    Impersonation(#[from] ImpersonationError),

    #[error("Stream error: {0}")]
    Stream(#[from] TransportError),

    #[error("Backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the tunnel client's lifecycle operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Agent identity not initialized")]
    NotInitialized,

    #[error("Agent identity already initialized")]
    AlreadyInitialized,

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
