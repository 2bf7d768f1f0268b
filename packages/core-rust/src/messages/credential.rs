//! Canonical request/response values for the `Hash` and `Validate` methods.
//!
//! These are the only representation the operation chain sees; every
//! transport decodes into them and encodes out of them. Successful JSON bodies
//! are `{"token": ...}` and `{"valid": ...}` because `failure` is skipped when
//! absent.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::base::Failure;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to derive a token from a secret.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
    /// The secret to derive a token from.
    pub secret: String,
}

impl HashRequest {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for HashRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashRequest")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Request to check a secret against a previously derived token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    /// The presented secret.
    pub secret: String,
    /// A token previously returned by `Hash`.
    pub token: String,
}

impl ValidateRequest {
    #[must_use]
    pub fn new(secret: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for ValidateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidateRequest")
            .field("secret", &"<redacted>")
            .field("token", &self.token)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Result of `Hash`. Logically failed when `failure` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HashResponse {
    /// The derived token; empty when the call failed.
    #[serde(default)]
    pub token: String,
    /// In-band business failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<Failure>,
}

impl HashResponse {
    #[must_use]
    pub fn ok(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            failure: None,
        }
    }

    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        Self {
            token: String::new(),
            failure: Some(failure),
        }
    }

    /// Collapse the in-band failure into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the in-band failure when the response is logically failed.
    pub fn into_result(self) -> Result<String, Failure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.token),
        }
    }
}

/// Result of `Validate`. Logically failed when `failure` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidateResponse {
    /// Whether the secret matched the token.
    #[serde(default)]
    pub valid: bool,
    /// In-band business failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<Failure>,
}

impl ValidateResponse {
    #[must_use]
    pub fn ok(valid: bool) -> Self {
        Self {
            valid,
            failure: None,
        }
    }

    #[must_use]
    pub fn failed(failure: Failure) -> Self {
        Self {
            valid: false,
            failure: Some(failure),
        }
    }

    /// Collapse the in-band failure into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the in-band failure when the response is logically failed.
    pub fn into_result(self) -> Result<bool, Failure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.valid),
        }
    }
}
