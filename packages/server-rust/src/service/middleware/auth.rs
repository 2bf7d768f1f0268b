//! Bearer-token authentication for server chains.
//!
//! Verifies `ctx.bearer` against the shared signing key and injects the
//! verified claims into `ctx.claims`. Any rejection short-circuits with
//! `OperationError::Auth` before the inner service runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::{Layer, Service};
use tracing::debug;
use vault_core::{AuthError, SigningKey};

use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// AuthLayer
// ---------------------------------------------------------------------------

/// Tower layer that authenticates every operation.
#[derive(Debug, Clone)]
pub struct AuthLayer {
    key: Arc<SigningKey>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(key: Arc<SigningKey>) -> Self {
        Self { key }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            key: Arc::clone(&self.key),
        }
    }
}

// ---------------------------------------------------------------------------
// AuthService
// ---------------------------------------------------------------------------

/// Service wrapper that rejects operations without a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthService<S> {
    inner: S,
    key: Arc<SigningKey>,
}

impl<S> Service<Operation> for AuthService<S>
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
        let verified = match op.ctx.bearer.as_deref() {
            None => Err(AuthError::Missing),
            Some(token) => self.key.verify(token),
        };

        match verified {
            Ok(claims) => {
                op.ctx.claims = Some(claims);
                Box::pin(self.inner.call(op))
            }
            Err(e) => {
                debug!(
                    method = op.method(),
                    call_id = op.ctx.call_id,
                    error = %e,
                    "authentication failed"
                );
                Box::pin(async move { Err(OperationError::Auth(e)) })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tower::ServiceExt;
    use vault_core::auth::{unix_now, DEFAULT_KEY_ID};
    use vault_core::messages::{HashRequest, HashResponse};
    use vault_core::Claims;

    use super::*;
    use crate::service::operation::{CallContext, OperationRequest};

    /// Echoes the key id of the injected claims as the token.
    #[derive(Clone, Default)]
    struct ClaimsEcho {
        calls: Arc<AtomicUsize>,
    }

    impl Service<Operation> for ClaimsEcho {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, op: Operation) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let kid = op
                .ctx
                .claims
                .and_then(|c| c.key_id)
                .unwrap_or_default();
            Box::pin(async move { Ok(OperationResponse::Hash(HashResponse::ok(kid))) })
        }
    }

    fn key() -> Arc<SigningKey> {
        Arc::new(SigningKey::new(DEFAULT_KEY_ID, "zmh298onj30"))
    }

    fn op(bearer: Option<String>) -> Operation {
        let mut ctx = CallContext::new("Hash");
        ctx.bearer = bearer;
        Operation::with_context(ctx, OperationRequest::Hash(HashRequest::new("s")))
    }

    #[tokio::test]
    async fn valid_token_injects_claims() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let svc = AuthLayer::new(Arc::clone(&key)).layer(ClaimsEcho::default());

        let resp = svc.oneshot(op(Some(token))).await.unwrap();
        assert_eq!(resp, OperationResponse::Hash(HashResponse::ok(DEFAULT_KEY_ID)));
    }

    #[tokio::test]
    async fn missing_token_never_reaches_inner() {
        let echo = ClaimsEcho::default();
        let calls = Arc::clone(&echo.calls);
        let svc = AuthLayer::new(key()).layer(echo);

        let err = svc.oneshot(op(None)).await.unwrap_err();
        assert!(matches!(err, OperationError::Auth(AuthError::Missing)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let key = key();
        let now = unix_now();
        let token = key
            .sign(&Claims {
                iat: now - 10,
                exp: now - 5,
            })
            .unwrap();
        let svc = AuthLayer::new(key).layer(ClaimsEcho::default());

        let err = svc.oneshot(op(Some(token))).await.unwrap_err();
        assert!(matches!(err, OperationError::Auth(AuthError::Expired)));
    }

    #[tokio::test]
    async fn token_from_another_key_is_rejected() {
        let token = SigningKey::new(DEFAULT_KEY_ID, "other-secret")
            .mint(Duration::from_secs(30))
            .unwrap();
        let svc = AuthLayer::new(key()).layer(ClaimsEcho::default());

        let err = svc.oneshot(op(Some(token))).await.unwrap_err();
        assert!(matches!(err, OperationError::Auth(AuthError::BadSignature)));
    }
}
