//! Cryptography for the reverse-tunnel agent
//!
//! - [`identity`]: the agent's asymmetric key pair and where it comes from
//! - [`envelope`]: per-stream handshake envelopes carrying a one-time key
//! - [`cipher`]: AES-256-GCM record stages for stream payloads

pub mod cipher;
pub mod envelope;
pub mod identity;

pub use cipher::{Direction, RecordOpener, RecordSealer, StreamKeyMaterial, MAX_RECORD_PLAINTEXT};
pub use envelope::{seal_envelope, HeaderCodec, HpkeHeaderCodec, MAX_ENVELOPE_LEN};
pub use identity::{AgentIdentity, FileKeyProvider, GeneratedKeyProvider, KeyProvider};

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key storage error: {0}")]
    KeyStorage(#[from] std::io::Error),

    #[error("Malformed handshake envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Handshake envelope could not be decrypted")]
    EnvelopeDecrypt,

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Record authentication failed")]
    RecordAuth,

    #[error("Record counter exhausted")]
    CounterExhausted,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
