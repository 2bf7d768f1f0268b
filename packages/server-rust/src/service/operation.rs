//! Operation types flowing through the pipeline: call context, request,
//! response and the error taxonomy shared by every decorator and transport.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vault_core::messages::{
    Failure, FailureKind, HashRequest, HashResponse, ValidateRequest, ValidateResponse,
};
use vault_core::{AuthError, PrimitiveError, VerifiedClaims};

use crate::store::StoreError;

/// Method names used as router keys and metric labels.
pub mod methods {
    pub const HASH: &str = "Hash";
    pub const VALIDATE: &str = "Validate";

    /// Every method served by the vault.
    pub const ALL: [&str; 2] = [HASH, VALIDATE];
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Per-call context carried with every operation through the pipeline.
///
/// Created once per inbound or outbound call and never shared between calls.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: u64,
    pub method: &'static str,
    /// Absolute deadline, if the caller set one.
    pub deadline: Option<Instant>,
    /// Cancelled when the caller goes away (connection closed, request dropped).
    pub cancel: CancellationToken,
    /// Bearer token: filled in by the signer on the client, read by the
    /// authenticator on the server.
    pub bearer: Option<String>,
    /// Claims injected by the authenticator after successful verification.
    pub claims: Option<VerifiedClaims>,
}

impl CallContext {
    /// Creates a context with a fresh call id, no deadline and no bearer.
    #[must_use]
    pub fn new(method: &'static str) -> Self {
        Self {
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            method,
            deadline: None,
            cancel: CancellationToken::new(),
            bearer: None,
            claims: None,
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets the deadline, keeping the earlier one if a deadline is already set.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    #[must_use]
    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Time left until the deadline; `None` when no deadline is set.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Drives `fut` to completion unless the call is cancelled or its
    /// deadline passes first.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `DeadlineExceeded` when the call is cut short,
    /// otherwise whatever `fut` returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, OperationError>
    where
        F: Future<Output = Result<T, OperationError>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(OperationError::Cancelled),
            () = deadline => Err(OperationError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// Canonical request of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Hash(HashRequest),
    Validate(ValidateRequest),
}

impl OperationRequest {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Hash(_) => methods::HASH,
            Self::Validate(_) => methods::VALIDATE,
        }
    }

    /// Input rendered for logs with the secret masked.
    #[must_use]
    pub fn masked(&self) -> String {
        match self {
            Self::Hash(req) => format!("{req:?}"),
            Self::Validate(req) => format!("{req:?}"),
        }
    }
}

/// A request bound to its call context; the unit every layer wraps.
#[derive(Debug, Clone)]
pub struct Operation {
    pub ctx: CallContext,
    pub request: OperationRequest,
}

impl Operation {
    /// Builds an operation with a fresh context for the request's method.
    #[must_use]
    pub fn new(request: OperationRequest) -> Self {
        Self {
            ctx: CallContext::new(request.method()),
            request,
        }
    }

    #[must_use]
    pub fn with_context(ctx: CallContext, request: OperationRequest) -> Self {
        Self { ctx, request }
    }

    #[must_use]
    pub fn method(&self) -> &'static str {
        self.request.method()
    }
}

/// Canonical response of one method. May carry an in-band business failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResponse {
    Hash(HashResponse),
    Validate(ValidateResponse),
}

impl OperationResponse {
    /// Wraps an in-band failure in the response shape of `method`.
    #[must_use]
    pub fn failed(method: &str, failure: Failure) -> Self {
        if method == methods::VALIDATE {
            Self::Validate(ValidateResponse::failed(failure))
        } else {
            Self::Hash(HashResponse::failed(failure))
        }
    }

    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Hash(resp) => resp.failure.as_ref(),
            Self::Validate(resp) => resp.failure.as_ref(),
        }
    }

    /// True when the response carries no in-band failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// Failures that travel out-of-band (as `Err`) through the pipeline.
///
/// `Validation`, `Primitive` and `Store` are business failures: the endpoint
/// converts them into an in-band `failure` before they leave the service.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("rate limit exceeded for {method}")]
    RateLimited { method: &'static str },
    #[error("circuit open for {method}")]
    CircuitOpen { method: &'static str },
    #[error("primitive failure: {0}")]
    Primitive(#[from] PrimitiveError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("call cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Failures carried in-band inside the response rather than as `Err`.
    #[must_use]
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Primitive(_) | Self::Store(_)
        )
    }

    /// Outcomes the circuit breaker counts against the downstream.
    ///
    /// Caller-caused outcomes (bad input, bad credentials, throttling,
    /// cancellation) are not faults.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::DeadlineExceeded
                | Self::Store(_)
                | Self::Primitive(_)
                | Self::Internal(_)
        )
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::Auth(_) => FailureKind::Auth,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Primitive(_) => FailureKind::Primitive,
            Self::Store(_) => FailureKind::Store,
            Self::DeadlineExceeded => FailureKind::DeadlineExceeded,
            Self::Cancelled => FailureKind::Cancelled,
            Self::UnknownMethod { .. } => FailureKind::UnknownMethod,
            Self::Transport(_) | Self::Internal(_) => FailureKind::Internal,
        }
    }

    /// Message without the category prefix of `Display`; the kind travels
    /// separately on the wire.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Validation(message) | Self::Transport(message) => message.clone(),
            Self::Auth(e) => e.to_string(),
            Self::Primitive(e) => e.to_string(),
            Self::Store(e) => e.to_string(),
            Self::Internal(e) => e.to_string(),
            _ => self.to_string(),
        }
    }

    /// Wire representation of this error.
    #[must_use]
    pub fn to_failure(&self) -> Failure {
        Failure::new(self.kind(), self.detail())
    }

    /// Rebuilds the error a remote peer reported for a call to `method`.
    ///
    /// Inverse of [`to_failure`](Self::to_failure) up to the type of the inner
    /// error, which only survives as its message.
    #[must_use]
    pub fn from_failure(method: &'static str, failure: Failure) -> Self {
        let Failure { message, kind } = failure;
        match kind {
            FailureKind::Validation => Self::Validation(message),
            FailureKind::Auth => Self::Auth(AuthError::Rejected(message)),
            FailureKind::RateLimited => Self::RateLimited { method },
            FailureKind::CircuitOpen => Self::CircuitOpen { method },
            FailureKind::Primitive => Self::Primitive(PrimitiveError::Remote(message)),
            FailureKind::Store => Self::Store(StoreError::Remote(message)),
            FailureKind::DeadlineExceeded => Self::DeadlineExceeded,
            FailureKind::Cancelled => Self::Cancelled,
            FailureKind::UnknownMethod => Self::UnknownMethod {
                method: method.to_string(),
            },
            FailureKind::Internal => Self::Internal(anyhow::anyhow!(message)),
        }
    }
}
