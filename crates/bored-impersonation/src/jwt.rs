//! Identity-provider token verification

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{ImpersonationError, ImpersonationResult};

/// Claims used to build the impersonated identity
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IdentityClaims {
    /// Subject, forwarded as the impersonated user
    pub sub: String,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Groups, each forwarded as an impersonated group
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Verifies JWTs against the identity provider's public key
///
/// The accepted algorithms follow the key type: RSA keys accept RS* and
/// PS*, EC keys accept ES256 and ES384, Ed25519 keys accept EdDSA.
/// Only the signature and expiration are validated.
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    key_kind: &'static str,
}

impl TokenVerifier {
    pub fn from_pem(public_key_pem: &str) -> ImpersonationResult<Self> {
        let pem = public_key_pem.trim().as_bytes();
        if pem.is_empty() {
            return Err(ImpersonationError::InvalidKey("key is empty".to_string()));
        }

        let (decoding_key, algorithms, key_kind) = if let Ok(key) = DecodingKey::from_rsa_pem(pem)
        {
            let algorithms = vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
            ];
            (key, algorithms, "rsa")
        } else if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            (key, vec![Algorithm::ES256, Algorithm::ES384], "ec")
        } else if let Ok(key) = DecodingKey::from_ed_pem(pem) {
            (key, vec![Algorithm::EdDSA], "ed25519")
        } else {
            return Err(ImpersonationError::InvalidKey(
                "expected an RSA, EC or Ed25519 public key in PEM format".to_string(),
            ));
        };

        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            decoding_key,
            validation,
            key_kind,
        })
    }

    pub fn verify(&self, token: &str) -> ImpersonationResult<IdentityClaims> {
        let token_data = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ImpersonationError::InvalidToken(e.to_string()))?;
        Ok(token_data.claims)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("key_kind", &self.key_kind)
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(key_pair: &rcgen::KeyPair, claims: serde_json::Value) -> String {
        let encoding_key = EncodingKey::from_ec_pem(key_pair.serialize_pem().as_bytes()).unwrap();
        encode(&Header::new(Algorithm::ES256), &claims, &encoding_key).unwrap()
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_valid_token_yields_claims() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let verifier = TokenVerifier::from_pem(&key_pair.public_key_pem()).unwrap();

        let token = sign(
            &key_pair,
            serde_json::json!({ "sub": "alice", "exp": in_one_hour(), "groups": ["dev", "ops"] }),
        );
        let claims = verifier.verify(&token).unwrap();

        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.groups, vec!["dev", "ops"]);
    }

    #[test]
    fn test_groups_are_optional() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let verifier = TokenVerifier::from_pem(&key_pair.public_key_pem()).unwrap();

        let token = sign(&key_pair, serde_json::json!({ "sub": "bob", "exp": in_one_hour() }));
        assert!(verifier.verify(&token).unwrap().groups.is_empty());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let verifier = TokenVerifier::from_pem(&key_pair.public_key_pem()).unwrap();

        let expired = chrono::Utc::now().timestamp() - 3600;
        let token = sign(&key_pair, serde_json::json!({ "sub": "alice", "exp": expired }));
        assert!(matches!(
            verifier.verify(&token),
            Err(ImpersonationError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_missing_exp_is_rejected() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let verifier = TokenVerifier::from_pem(&key_pair.public_key_pem()).unwrap();

        let token = sign(&key_pair, serde_json::json!({ "sub": "alice" }));
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_token_from_other_key_is_rejected() {
        let trusted = rcgen::KeyPair::generate().unwrap();
        let attacker = rcgen::KeyPair::generate().unwrap();
        let verifier = TokenVerifier::from_pem(&trusted.public_key_pem()).unwrap();

        let token = sign(&attacker, serde_json::json!({ "sub": "mallory", "exp": in_one_hour() }));
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_garbage_key_is_rejected() {
        assert!(matches!(
            TokenVerifier::from_pem("not a key"),
            Err(ImpersonationError::InvalidKey(_))
        ));
        assert!(TokenVerifier::from_pem("   ").is_err());
    }
}
