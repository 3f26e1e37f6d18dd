//! Identity impersonation for requests forwarded to the backend API
//!
//! Clients authenticate to the broker with a token from the identity
//! provider. The agent verifies that token, then forwards the request
//! under its own service-account credentials while asking the backend to
//! act as the verified user.

pub mod http;
pub mod jwt;

pub use http::RequestRewriter;
pub use jwt::{IdentityClaims, TokenVerifier};

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Impersonation errors
///
/// All of these are local to the stream that produced them.
#[derive(Debug, Error)]
pub enum ImpersonationError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Request carries no bearer token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid identity provider key: {0}")]
    InvalidKey(String),
}

pub type ImpersonationResult<T> = Result<T, ImpersonationError>;

/// Per-stream transform applied to decrypted backend-bound bytes
pub trait ImpersonationStage: Send {
    /// Feed the next bytes of the stream, returning what should be written
    /// to the backend. Output may lag input while a request head is still
    /// incomplete.
    fn process(&mut self, data: &[u8]) -> ImpersonationResult<Bytes>;
}

/// Binds impersonation credentials and creates one stage per stream
pub trait ImpersonationFilter: Send + Sync {
    fn new_stage(&self) -> Box<dyn ImpersonationStage>;
}

/// Verifies identity-provider JWTs and rewrites requests to impersonate
/// the token's subject using the service-account token
#[derive(Clone)]
pub struct JwtImpersonator {
    verifier: Arc<TokenVerifier>,
    service_account_token: Arc<str>,
}

impl JwtImpersonator {
    pub fn new(
        idp_public_key_pem: &str,
        service_account_token: &str,
    ) -> ImpersonationResult<Self> {
        let service_account_token = service_account_token.trim();
        if service_account_token.is_empty() {
            return Err(ImpersonationError::InvalidKey(
                "service account token is empty".to_string(),
            ));
        }

        Ok(Self {
            verifier: Arc::new(TokenVerifier::from_pem(idp_public_key_pem)?),
            service_account_token: Arc::from(service_account_token),
        })
    }
}

impl std::fmt::Debug for JwtImpersonator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtImpersonator")
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}

impl ImpersonationFilter for JwtImpersonator {
    fn new_stage(&self) -> Box<dyn ImpersonationStage> {
        Box::new(RequestRewriter::new(
            self.verifier.clone(),
            self.service_account_token.clone(),
        ))
    }
}
