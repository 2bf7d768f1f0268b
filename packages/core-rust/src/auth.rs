//! Bearer tokens: short-lived HS256 JWTs proving the caller holds the shared key.
//!
//! The same [`SigningKey`] value is handed to the client-side signer and the
//! server-side authenticator at construction time and never mutated. Tokens
//! carry `iat` and `exp` claims and name their key in the `kid` header.
//! Verification is stateless: no session is kept on the server.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

/// Key identifier used when none is configured.
pub const DEFAULT_KEY_ID: &str = "kid-header";

/// Reasons a bearer token is rejected or cannot be produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("bearer token missing")]
    Missing,
    #[error("bearer token malformed: {0}")]
    Malformed(String),
    #[error("bearer token signature invalid")]
    BadSignature,
    #[error("bearer token expired")]
    Expired,
    #[error("bearer token signed with unknown key {0:?}")]
    UnknownKey(String),
    #[error("failed to sign bearer token: {0}")]
    Signing(String),
    /// A remote authenticator refused the token; the reason is its message.
    #[error("{0}")]
    Rejected(String),
}

/// Registered claims carried in every bearer token (seconds since the epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    /// Claims issued now and valid for `ttl` (at least one second).
    #[must_use]
    pub fn issued_now(ttl: Duration) -> Self {
        let now = unix_now();
        Self {
            iat: now,
            exp: now + ttl.as_secs().max(1),
        }
    }
}

/// Claims that passed verification, made available to inner layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaims {
    pub issued_at: u64,
    pub expires_at: u64,
    pub key_id: Option<String>,
}

/// Shared symmetric key used to sign and verify bearer tokens.
#[derive(Clone)]
pub struct SigningKey {
    key_id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    #[must_use]
    pub fn new(key_id: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        Self {
            key_id: key_id.into(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Mint a fresh token valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` if encoding fails.
    pub fn mint(&self, ttl: Duration) -> Result<String, AuthError> {
        self.sign(&Claims::issued_now(ttl))
    }

    /// Sign arbitrary claims with this key.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Signing` if encoding fails.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.key_id.clone());
        encode(&header, claims, &self.encoding).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify signature, algorithm, key id and expiry of `token`.
    ///
    /// # Errors
    ///
    /// Returns the `AuthError` variant describing why the token was rejected.
    pub fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;
        if let Some(kid) = &header.kid {
            if kid != &self.key_id {
                return Err(AuthError::UnknownKey(kid.clone()));
            }
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            _ => AuthError::Malformed(e.to_string()),
        })?;

        Ok(VerifiedClaims {
            issued_at: data.claims.iat,
            expires_at: data.claims.exp,
            key_id: header.kid,
        })
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::new(DEFAULT_KEY_ID, "zmh298onj30")
    }

    #[test]
    fn minted_token_verifies_with_claims() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let claims = key.verify(&token).unwrap();
        assert_eq!(claims.key_id.as_deref(), Some(DEFAULT_KEY_ID));
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn expired_token_is_rejected() {
        let key = key();
        let now = unix_now();
        let token = key
            .sign(&Claims {
                iat: now - 120,
                exp: now - 60,
            })
            .unwrap();
        assert_eq!(key.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn expired_token_signed_with_other_key_is_rejected() {
        let now = unix_now();
        let token = SigningKey::new(DEFAULT_KEY_ID, "other")
            .sign(&Claims {
                iat: now - 120,
                exp: now - 60,
            })
            .unwrap();
        assert!(key().verify(&token).is_err());
    }

    #[test]
    fn wrong_key_is_bad_signature() {
        let token = SigningKey::new(DEFAULT_KEY_ID, "not-the-key")
            .mint(Duration::from_secs(30))
            .unwrap();
        assert_eq!(key().verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn unknown_key_id_is_rejected_before_signature_check() {
        let token = SigningKey::new("rotated", "zmh298onj30")
            .mint(Duration::from_secs(30))
            .unwrap();
        assert_eq!(
            key().verify(&token),
            Err(AuthError::UnknownKey("rotated".into()))
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            key().verify("definitely.not.jwt"),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn debug_hides_secret_material() {
        let printed = format!("{:?}", key());
        assert!(printed.contains(DEFAULT_KEY_ID));
        assert!(!printed.contains("zmh298onj30"));
    }
}
