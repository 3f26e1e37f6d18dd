//! Per-stream handshake envelopes
//!
//! The first bytes of every stream carry an envelope sealed to the agent's
//! public key: `u16 BE length | encapsulated key (32) | HPKE ciphertext`.
//! The plaintext is the stream's [`StreamKeyMaterial`].

use bytes::{Buf, BytesMut};
use hpke::{
    aead::AesGcm256, kdf::HkdfSha256, kem::X25519HkdfSha256, single_shot_open, single_shot_seal,
    Deserializable, Kem, OpModeR, OpModeS, Serializable,
};

use crate::{AgentIdentity, CryptoError, CryptoResult, StreamKeyMaterial};

type EnvelopeKem = X25519HkdfSha256;
type EnvelopeKdf = HkdfSha256;
type EnvelopeAead = AesGcm256;

/// Upper bound on the envelope body
pub const MAX_ENVELOPE_LEN: usize = 1024;

const ENVELOPE_INFO: &[u8] = b"bored-agent stream key v1";
const ENCAPPED_KEY_LEN: usize = 32;
const LENGTH_PREFIX: usize = 2;

/// Decodes the handshake header at the start of a stream
///
/// Implementations are sans-IO: the caller feeds an accumulating buffer and
/// retries with more bytes whenever `Ok(None)` comes back. On success the
/// envelope is consumed from `buf` and anything after it stays in place.
pub trait HeaderCodec: Send + Sync {
    fn decode(
        &self,
        buf: &mut BytesMut,
        identity: &AgentIdentity,
    ) -> CryptoResult<Option<StreamKeyMaterial>>;
}

/// HPKE (X25519, HKDF-SHA256, AES-256-GCM) envelope codec
#[derive(Debug, Default, Clone, Copy)]
pub struct HpkeHeaderCodec;

impl HeaderCodec for HpkeHeaderCodec {
    fn decode(
        &self,
        buf: &mut BytesMut,
        identity: &AgentIdentity,
    ) -> CryptoResult<Option<StreamKeyMaterial>> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len <= ENCAPPED_KEY_LEN || len > MAX_ENVELOPE_LEN {
            return Err(CryptoError::MalformedEnvelope(format!(
                "envelope length {} out of range",
                len
            )));
        }
        if buf.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX);
        let body = buf.split_to(len);
        let (encapped_bytes, ciphertext) = body.split_at(ENCAPPED_KEY_LEN);

        let encapped_key = <EnvelopeKem as Kem>::EncappedKey::from_bytes(encapped_bytes)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("bad encapsulated key: {:?}", e)))?;

        let plaintext = zeroize::Zeroizing::new(
            single_shot_open::<EnvelopeAead, EnvelopeKdf, EnvelopeKem>(
                &OpModeR::Base,
                identity.private_key(),
                &encapped_key,
                ENVELOPE_INFO,
                ciphertext,
                b"",
            )
            .map_err(|_| CryptoError::EnvelopeDecrypt)?,
        );

        StreamKeyMaterial::from_bytes(&plaintext).map(Some)
    }
}

/// Seal key material to an agent's public key
///
/// This is the broker side of the handshake.
pub fn seal_envelope(public_key: &[u8], material: &StreamKeyMaterial) -> CryptoResult<Vec<u8>> {
    let recipient = <EnvelopeKem as Kem>::PublicKey::from_bytes(public_key)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid public key: {:?}", e)))?;

    let mut rng = rand::thread_rng();
    let plaintext = zeroize::Zeroizing::new(material.to_bytes());
    let (encapped_key, ciphertext) = single_shot_seal::<EnvelopeAead, EnvelopeKdf, EnvelopeKem, _>(
        &OpModeS::Base,
        &recipient,
        ENVELOPE_INFO,
        &plaintext,
        b"",
        &mut rng,
    )
    .map_err(|e| CryptoError::InvalidKey(format!("HPKE seal failed: {:?}", e)))?;

    let encapped = encapped_key.to_bytes();
    let body_len = encapped.len() + ciphertext.len();

    let mut out = Vec::with_capacity(LENGTH_PREFIX + body_len);
    out.extend_from_slice(&(body_len as u16).to_be_bytes());
    out.extend_from_slice(&encapped);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}
