//! Failure payload shared by every transport.
//!
//! A `Failure` is what travels on the wire whenever a call does not produce a
//! normal response body. It serializes as `{"error": "...", "kind": "..."}`;
//! `kind` is optional on decode so that plain `{"error": "..."}` bodies from
//! older peers still parse (they decode as [`FailureKind::Internal`]).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FailureKind
// ---------------------------------------------------------------------------

/// Wire discriminator mirroring the operation error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed request; never retried.
    Validation,
    /// Missing, invalid or expired bearer token.
    Auth,
    /// Admission denied by a rate limiter.
    RateLimited,
    /// Fast-fail while the circuit breaker is open.
    CircuitOpen,
    /// Credential primitive misconfiguration.
    Primitive,
    /// Secret store failed to persist a derived token.
    Store,
    /// The call deadline elapsed before completion.
    DeadlineExceeded,
    /// The caller abandoned the call.
    Cancelled,
    /// No chain is registered for the requested method.
    UnknownMethod,
    /// Anything else, including bodies that carry no `kind`.
    #[default]
    Internal,
}

impl FailureKind {
    /// Business failures travel in-band inside a response's `failure` field.
    /// Every other kind is a transport-level rejection.
    #[must_use]
    pub fn is_business(self) -> bool {
        matches!(self, Self::Validation | Self::Primitive | Self::Store)
    }

    /// Whether this outcome indicates an unhealthy callee. Caller-caused
    /// outcomes (bad input, bad credentials, throttling) are not faults.
    #[must_use]
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            Self::Primitive | Self::Store | Self::DeadlineExceeded | Self::Internal
        )
    }

    /// Stable lowercase name, logged as the `kind` of a completed call.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::Primitive => "primitive",
            Self::Store => "store",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::UnknownMethod => "unknown_method",
            Self::Internal => "internal",
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// A failure description carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct Failure {
    /// Human-readable description.
    #[serde(rename = "error")]
    pub message: String,
    /// Machine-readable category.
    #[serde(default)]
    pub kind: FailureKind,
}

impl Failure {
    /// Create a failure of the given kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Shorthand for a [`FailureKind::Validation`] failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// See [`FailureKind::is_business`].
    #[must_use]
    pub fn is_business(&self) -> bool {
        self.kind.is_business()
    }

    /// See [`FailureKind::is_fault`].
    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.kind.is_fault()
    }
}
