//! AES-256-GCM record layer for stream payloads
//!
//! Each record on the wire is `u32 BE length | ciphertext || tag`. Nonces are
//! derived from the stream IV and a per-direction record counter, so the same
//! key material can protect both directions of a stream without reuse.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bytes::{Buf, BytesMut};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, CryptoResult};

/// Largest plaintext carried by one record
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

const TAG_LEN: usize = 16;
const LENGTH_PREFIX: usize = 4;

/// One-time symmetric key material delivered in a stream's handshake envelope
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct StreamKeyMaterial {
    pub key: [u8; 32],
    pub iv: [u8; 12],
}

impl StreamKeyMaterial {
    pub const ENCODED_LEN: usize = 32 + 12;

    /// Fresh random key material
    pub fn generate() -> Self {
        use rand::RngCore;

        let mut material = Self {
            key: [0u8; 32],
            iv: [0u8; 12],
        };
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut material.key);
        rng.fill_bytes(&mut material.iv);
        material
    }

    /// Parse the `key || iv` layout used inside envelopes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected {} bytes of key material, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }

        let mut material = Self {
            key: [0u8; 32],
            iv: [0u8; 12],
        };
        material.key.copy_from_slice(&bytes[..32]);
        material.iv.copy_from_slice(&bytes[32..]);
        Ok(material)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.iv);
        out
    }
}

impl std::fmt::Debug for StreamKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamKeyMaterial").finish_non_exhaustive()
    }
}

/// Which way a record travels through the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Broker to backend
    Inbound,
    /// Backend to broker
    Outbound,
}

impl Direction {
    fn nonce_bit(self) -> u64 {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1 << 63,
        }
    }
}

struct RecordState {
    cipher: Aes256Gcm,
    iv: [u8; 12],
    direction: Direction,
    counter: u64,
}

impl RecordState {
    fn new(material: &StreamKeyMaterial, direction: Direction) -> CryptoResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&material.key)
            .map_err(|e| CryptoError::InvalidKey(format!("Failed to create cipher: {}", e)))?;
        Ok(Self {
            cipher,
            iv: material.iv,
            direction,
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> CryptoResult<[u8; 12]> {
        if self.counter >= 1 << 63 {
            return Err(CryptoError::CounterExhausted);
        }
        let sequence = (self.direction.nonce_bit() | self.counter).to_be_bytes();
        self.counter += 1;

        let mut nonce = self.iv;
        for (byte, seq) in nonce[4..].iter_mut().zip(sequence.iter()) {
            *byte ^= seq;
        }
        Ok(nonce)
    }
}

impl Drop for RecordState {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Encrypts plaintext into length-prefixed records
pub struct RecordSealer {
    state: RecordState,
}

impl RecordSealer {
    pub fn new(material: &StreamKeyMaterial, direction: Direction) -> CryptoResult<Self> {
        Ok(Self {
            state: RecordState::new(material, direction)?,
        })
    }

    /// Seal `plaintext`, splitting it into as many records as needed
    pub fn seal(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let records = plaintext.len().div_ceil(MAX_RECORD_PLAINTEXT).max(1);
        let mut out =
            Vec::with_capacity(plaintext.len() + records * (LENGTH_PREFIX + TAG_LEN));

        for chunk in plaintext.chunks(MAX_RECORD_PLAINTEXT) {
            let nonce = self.state.next_nonce()?;
            let ciphertext = self
                .state
                .cipher
                .encrypt(Nonce::from_slice(&nonce), chunk)
                .map_err(|_| CryptoError::RecordAuth)?;

            out.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
            out.extend_from_slice(&ciphertext);
        }

        Ok(out)
    }

    pub fn records_sealed(&self) -> u64 {
        self.state.counter
    }
}

/// Decrypts length-prefixed records from an accumulating buffer
pub struct RecordOpener {
    state: RecordState,
}

impl RecordOpener {
    pub fn new(material: &StreamKeyMaterial, direction: Direction) -> CryptoResult<Self> {
        Ok(Self {
            state: RecordState::new(material, direction)?,
        })
    }

    /// Open the next complete record in `buf`
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; partial records are left in place.
    pub fn open_next(&mut self, buf: &mut BytesMut) -> CryptoResult<Option<Vec<u8>>> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if !(TAG_LEN..=MAX_RECORD_PLAINTEXT + TAG_LEN).contains(&len) {
            return Err(CryptoError::MalformedRecord(format!(
                "record length {} out of range",
                len
            )));
        }
        if buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let ciphertext = buf.split_to(len);
        let nonce = self.state.next_nonce()?;

        self.state
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map(Some)
            .map_err(|_| CryptoError::RecordAuth)
    }

    pub fn records_opened(&self) -> u64 {
        self.state.counter
    }
}
