//! Bearer-token minting for client chains.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tower::{Layer, Service};
use vault_core::SigningKey;

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// SignerLayer
// ---------------------------------------------------------------------------

/// Tower layer that attaches a freshly minted bearer token to every call.
#[derive(Debug, Clone)]
pub struct SignerLayer {
    key: Arc<SigningKey>,
    ttl: Duration,
}

impl SignerLayer {
    #[must_use]
    pub fn new(key: Arc<SigningKey>, ttl: Duration) -> Self {
        Self { key, ttl }
    }
}

impl<S> Layer<S> for SignerLayer {
    type Service = SignerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SignerService {
            inner,
            key: Arc::clone(&self.key),
            ttl: self.ttl,
        }
    }
}

// ---------------------------------------------------------------------------
// SignerService
// ---------------------------------------------------------------------------

/// Service wrapper that sets `ctx.bearer` before calling inward.
#[derive(Debug, Clone)]
pub struct SignerService<S> {
    inner: S,
    key: Arc<SigningKey>,
    ttl: Duration,
}

impl<S> Service<Operation> for SignerService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut op: Operation) -> Self::Future {
        match self.key.mint(self.ttl) {
            Ok(token) => {
                op.ctx.bearer = Some(token);
                Box::pin(self.inner.call(op))
            }
            Err(e) => Box::pin(async move { Err(OperationError::Auth(e)) }),
        }
    }
}
