//! Credential primitive: derive and verify salted one-way tokens.
//!
//! Tokens are self-describing (`$2b$<cost>$<salt><digest>`), so verification
//! needs nothing but the secret and the token. The primitive is pure and
//! synchronous; callers on an async runtime should move calls onto the
//! blocking pool since a single derivation costs tens of milliseconds at the
//! default cost.

use std::fmt;
use std::sync::OnceLock;

/// Lowest cost factor accepted by [`BcryptPrimitive`].
pub const MIN_COST: u32 = 4;
/// Highest cost factor accepted by [`BcryptPrimitive`].
pub const MAX_COST: u32 = 31;
/// Cost factor used when none is configured.
pub const DEFAULT_COST: u32 = 10;
/// Secrets longer than this are silently truncated by bcrypt.
pub const MAX_SECRET_BYTES: usize = 72;

/// Errors from deriving a token. Raised locally only for invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrimitiveError {
    #[error("cost factor {cost} outside supported range {}..={}", MIN_COST, MAX_COST)]
    InvalidCost { cost: u32 },
    #[error("token derivation failed: {0}")]
    Derive(String),
    /// Reported by a remote peer; the message is its description.
    #[error("{0}")]
    Remote(String),
}

/// Contract of the hashing collaborator.
///
/// - `derive` embeds a fresh salt on every call, so two derivations of the same
///   secret differ, yet both verify against it.
/// - `verify` is deterministic and never errors: a mismatch and a malformed
///   token both yield `false`, in comparable time.
pub trait CredentialPrimitive: Send + Sync + 'static {
    /// Derive a token from `secret`.
    ///
    /// # Errors
    ///
    /// Returns `PrimitiveError` only when the primitive is misconfigured.
    fn derive(&self, secret: &str) -> Result<String, PrimitiveError>;

    /// Check `secret` against `token`.
    fn verify(&self, secret: &str, token: &str) -> bool;
}

// ---------------------------------------------------------------------------
// BcryptPrimitive
// ---------------------------------------------------------------------------

/// bcrypt-backed primitive.
pub struct BcryptPrimitive {
    cost: u32,
    /// Token of the configured cost, verified against when the presented token
    /// does not parse, so that malformed tokens cost as much as mismatches.
    decoy: OnceLock<Option<String>>,
}

impl BcryptPrimitive {
    /// Create a primitive with the given cost factor. An out-of-range cost is
    /// reported by `derive`, not here.
    #[must_use]
    pub fn new(cost: u32) -> Self {
        Self {
            cost,
            decoy: OnceLock::new(),
        }
    }

    fn decoy(&self) -> Option<&str> {
        self.decoy
            .get_or_init(|| bcrypt::hash("decoy", self.cost).ok())
            .as_deref()
    }
}

impl Default for BcryptPrimitive {
    fn default() -> Self {
        Self::new(DEFAULT_COST)
    }
}

impl fmt::Debug for BcryptPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BcryptPrimitive")
            .field("cost", &self.cost)
            .finish_non_exhaustive()
    }
}

impl CredentialPrimitive for BcryptPrimitive {
    fn derive(&self, secret: &str) -> Result<String, PrimitiveError> {
        if !(MIN_COST..=MAX_COST).contains(&self.cost) {
            return Err(PrimitiveError::InvalidCost { cost: self.cost });
        }
        bcrypt::hash(secret, self.cost).map_err(|e| PrimitiveError::Derive(e.to_string()))
    }

    fn verify(&self, secret: &str, token: &str) -> bool {
        match bcrypt::verify(secret, token) {
            Ok(valid) => valid,
            Err(e) => {
                tracing::debug!(error = %e, "token did not parse, verifying against decoy");
                if let Some(decoy) = self.decoy() {
                    let _ = bcrypt::verify(secret, decoy);
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn fast() -> BcryptPrimitive {
        BcryptPrimitive::new(MIN_COST)
    }

    #[test]
    fn derived_token_verifies() {
        let p = fast();
        let token = p.derive("znm9832nmrfz4egwy43rn8").unwrap();
        assert!(p.verify("znm9832nmrfz4egwy43rn8", &token));
    }

    #[test]
    fn wrong_secret_does_not_verify() {
        let p = fast();
        let token = p.derive("correct horse").unwrap();
        assert!(!p.verify("wrong", &token));
    }

    #[test]
    fn token_carries_algorithm_and_cost_marker() {
        let token = fast().derive("secret").unwrap();
        assert!(token.starts_with("$2b$04$"), "unexpected token {token}");
    }

    #[test]
    fn derive_is_salted() {
        let p = fast();
        let a = p.derive("same").unwrap();
        let b = p.derive("same").unwrap();
        assert_ne!(a, b);
        assert!(p.verify("same", &a));
        assert!(p.verify("same", &b));
    }

    #[test]
    fn malformed_token_is_false_not_error() {
        let p = fast();
        assert!(!p.verify("secret", "not-a-token"));
        assert!(!p.verify("secret", ""));
    }

    #[test]
    fn out_of_range_cost_fails_derive() {
        assert_eq!(
            BcryptPrimitive::new(3).derive("secret"),
            Err(PrimitiveError::InvalidCost { cost: 3 })
        );
        assert_eq!(
            BcryptPrimitive::new(32).derive("secret"),
            Err(PrimitiveError::InvalidCost { cost: 32 })
        );
    }

    #[test]
    fn misconfigured_primitive_still_verifies_existing_tokens() {
        let token = fast().derive("secret").unwrap();
        let broken = BcryptPrimitive::new(99);
        assert!(broken.verify("secret", &token));
        assert!(!broken.verify("secret", "garbage"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn verify_accepts_own_derivation(secret in "[ -~]{1,40}") {
            let p = fast();
            let token = p.derive(&secret).unwrap();
            prop_assert!(p.verify(&secret, &token));
        }

        #[test]
        fn verify_rejects_other_secrets(a in "[a-z]{1,20}", b in "[A-Z]{1,20}") {
            let p = fast();
            let token = p.derive(&b).unwrap();
            prop_assert!(!p.verify(&a, &token));
        }
    }
}
