//! Agent identity key pair
//!
//! The broker encrypts every stream's key material to the agent's X25519
//! public key. The public half is presented at connect time as base64 of
//! the raw 32 bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hpke::{kem::X25519HkdfSha256, Deserializable, Kem, Serializable};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult};

/// The agent's asymmetric key pair
pub struct AgentIdentity {
    public_key: <X25519HkdfSha256 as Kem>::PublicKey,
    private_key: <X25519HkdfSha256 as Kem>::PrivateKey,
}

impl AgentIdentity {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let (private_key, public_key) = X25519HkdfSha256::gen_keypair(&mut rng);
        Self {
            public_key,
            private_key,
        }
    }

    /// Rebuild an identity from raw private key bytes
    pub fn from_private_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let private_key = <X25519HkdfSha256 as Kem>::PrivateKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid private key: {:?}", e)))?;
        let public_key = X25519HkdfSha256::sk_to_pk(&private_key);
        Ok(Self {
            public_key,
            private_key,
        })
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.to_bytes().to_vec()
    }

    /// Public key as presented to the broker
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.public_key.to_bytes())
    }

    pub(crate) fn private_key(&self) -> &<X25519HkdfSha256 as Kem>::PrivateKey {
        &self.private_key
    }

    fn private_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.private_key.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

/// Source of the agent's identity key pair
pub trait KeyProvider: Send + Sync {
    fn load(&self) -> CryptoResult<AgentIdentity>;
}

/// Generates a new key pair for every call
#[derive(Debug, Default, Clone, Copy)]
pub struct GeneratedKeyProvider;

impl KeyProvider for GeneratedKeyProvider {
    fn load(&self) -> CryptoResult<AgentIdentity> {
        let identity = AgentIdentity::generate();
        debug!("Generated ephemeral agent key pair");
        Ok(identity)
    }
}

/// Persists the private key as base64 in a file, creating it on first use
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_existing(&self) -> CryptoResult<AgentIdentity> {
        let contents = Zeroizing::new(std::fs::read_to_string(&self.path)?);
        let bytes = Zeroizing::new(STANDARD.decode(contents.trim()).map_err(|e| {
            CryptoError::InvalidKey(format!("{}: not valid base64: {}", self.path.display(), e))
        })?);
        AgentIdentity::from_private_bytes(&bytes)
    }

    fn create(&self) -> CryptoResult<AgentIdentity> {
        let identity = AgentIdentity::generate();
        let encoded = Zeroizing::new(STANDARD.encode(identity.private_key_bytes().as_slice()));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_private(&self.path, encoded.as_bytes())?;

        info!("Created agent key file at {}", self.path.display());
        Ok(identity)
    }
}

impl KeyProvider for FileKeyProvider {
    fn load(&self) -> CryptoResult<AgentIdentity> {
        if self.path.exists() {
            let identity = self.read_existing()?;
            debug!("Loaded agent key from {}", self.path.display());
            Ok(identity)
        } else {
            self.create()
        }
    }
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
