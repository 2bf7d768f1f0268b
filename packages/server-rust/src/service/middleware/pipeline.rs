//! Pipeline composition: wraps the innermost service of each method with the
//! decorator layers of its role.

use std::sync::Arc;
use std::time::Duration;

use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder};
use vault_core::SigningKey;

use super::auth::AuthLayer;
use super::circuit_breaker::CircuitBreakerLayer;
use super::instrument::InstrumentLayer;
use super::rate_limit::RateLimitLayer;
use super::signer::SignerLayer;
use crate::service::config::{MethodPolicy, PipelineConfig};
use crate::service::credential::CredentialService;
use crate::service::endpoint::CredentialEndpoint;
use crate::service::operation::{methods, Operation, OperationError, OperationResponse};
use crate::service::router::{BoxOperationService, OperationRouter};

/// `role` label of server-side metrics.
pub const SERVER_ROLE: &str = "server";
/// `role` label of client-side metrics.
pub const CLIENT_ROLE: &str = "client";

/// Build one server chain around `inner`.
///
/// Layer order (outermost to innermost):
/// 1. `RateLimitLayer` -- reject excess calls before doing any work
/// 2. `CircuitBreakerLayer` -- fail fast while the downstream is unhealthy
/// 3. `AuthLayer` -- verify the bearer token and inject claims
/// 4. `InstrumentLayer` -- record timing and outcome (closest to the handler)
#[must_use]
pub fn build_server_pipeline<S>(
    inner: S,
    policy: &MethodPolicy,
    key: Arc<SigningKey>,
) -> BoxOperationService
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(RateLimitLayer::new(&policy.rate_limit))
            .layer(CircuitBreakerLayer::new(&policy.breaker))
            .layer(AuthLayer::new(key))
            .layer(InstrumentLayer::new(SERVER_ROLE))
            .service(inner),
    )
}

/// Build one client chain around a transport endpoint.
///
/// Same order as the server chain, with the signer in place of the
/// authenticator.
#[must_use]
pub fn build_client_pipeline<S>(
    inner: S,
    policy: &MethodPolicy,
    key: Arc<SigningKey>,
    token_ttl: Duration,
) -> BoxOperationService
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    BoxCloneSyncService::new(
        ServiceBuilder::new()
            .layer(RateLimitLayer::new(&policy.rate_limit))
            .layer(CircuitBreakerLayer::new(&policy.breaker))
            .layer(SignerLayer::new(key, token_ttl))
            .layer(InstrumentLayer::new(CLIENT_ROLE))
            .service(inner),
    )
}

/// Route every method of the server to its own chain around `service`.
#[must_use]
pub fn build_server_router<C>(
    service: Arc<C>,
    config: &PipelineConfig,
    key: &Arc<SigningKey>,
) -> OperationRouter
where
    C: CredentialService + ?Sized + 'static,
{
    let mut router = OperationRouter::new();
    for method in methods::ALL {
        router.register(
            method,
            build_server_pipeline(
                CredentialEndpoint::new(Arc::clone(&service)),
                config.policy(method),
                Arc::clone(key),
            ),
        );
    }
    router
}

/// Route every method of the client to its own chain around `endpoint`.
#[must_use]
pub fn build_client_router<E>(
    endpoint: E,
    config: &PipelineConfig,
    key: &Arc<SigningKey>,
    token_ttl: Duration,
) -> OperationRouter
where
    E: Service<Operation, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    E::Future: Send + 'static,
{
    let mut router = OperationRouter::new();
    for method in methods::ALL {
        router.register(
            method,
            build_client_pipeline(
                endpoint.clone(),
                config.policy(method),
                Arc::clone(key),
                token_ttl,
            ),
        );
    }
    router
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use tower::ServiceExt;
    use vault_core::auth::DEFAULT_KEY_ID;
    use vault_core::messages::{FailureKind, HashRequest, ValidateRequest};

    use super::*;
    use crate::service::config::{BreakerConfig, LimiterMode, RateLimitConfig};
    use crate::service::credential::tests::PlainPrimitive;
    use crate::service::credential::VaultService;
    use crate::service::operation::{CallContext, OperationRequest};
    use crate::store::{MemoryStore, StoreError};

    fn key() -> Arc<SigningKey> {
        Arc::new(SigningKey::new(DEFAULT_KEY_ID, "zmh298onj30"))
    }

    fn service() -> Arc<VaultService<PlainPrimitive, MemoryStore>> {
        Arc::new(VaultService::new(
            PlainPrimitive,
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
        ))
    }

    fn roomy() -> PipelineConfig {
        PipelineConfig::with_limiter(RateLimitConfig {
            capacity: 100,
            refill_interval: Duration::from_millis(10),
            mode: LimiterMode::Erroring,
        })
    }

    #[tokio::test]
    async fn client_router_over_server_router_round_trips() {
        let key = key();
        let server = build_server_router(service(), &roomy(), &key);
        let client = build_client_router(
            server,
            &PipelineConfig::client(),
            &key,
            Duration::from_secs(30),
        );

        let ctx = CallContext::new(methods::HASH);
        let token = client.hash(&ctx, "znm9832nmrfz4egwy43rn8").await.unwrap();
        assert!(client.validate(&ctx, "znm9832nmrfz4egwy43rn8", &token).await.unwrap());
        assert!(!client.validate(&ctx, "wrong", &token).await.unwrap());
    }

    #[tokio::test]
    async fn unsigned_call_is_rejected_by_server_chain() {
        let router = build_server_router(service(), &roomy(), &key());
        let op = Operation::new(OperationRequest::Hash(HashRequest::new("s")));
        let err = router.oneshot(op).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn server_limiter_rejects_after_burst() {
        let router = build_server_router(service(), &PipelineConfig::server(), &key());

        // The burst is spent on calls that fail auth, which is not a fault.
        for _ in 0..2 {
            let op = Operation::new(OperationRequest::Hash(HashRequest::new("s")));
            let err = router.clone().oneshot(op).await.unwrap_err();
            assert_eq!(err.kind(), FailureKind::Auth);
        }

        let op = Operation::new(OperationRequest::Hash(HashRequest::new("s")));
        let err = router.oneshot(op).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimited);
    }

    #[tokio::test(start_paused = true)]
    async fn methods_have_independent_limiters() {
        let router = build_server_router(service(), &PipelineConfig::server(), &key());
        for _ in 0..2 {
            let op = Operation::new(OperationRequest::Hash(HashRequest::new("s")));
            let _ = router.clone().oneshot(op).await;
        }
        let op = Operation::new(OperationRequest::Hash(HashRequest::new("s")));
        let err = router.clone().oneshot(op).await.unwrap_err();
        assert!(matches!(err, OperationError::RateLimited { method: "Hash" }));

        let op = Operation::new(OperationRequest::Validate(ValidateRequest::new("s", "t")));
        let err = router.oneshot(op).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Auth);
    }

    /// Downstream that always times out its store write.
    #[derive(Clone)]
    struct FaultyEndpoint {
        calls: Arc<AtomicUsize>,
    }

    impl Service<Operation> for FaultyEndpoint {
        type Response = OperationResponse;
        type Error = OperationError;
        type Future =
            Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(OperationError::Store(StoreError::TimedOut)) })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_still_reports_rate_limited_first() {
        let key = key();
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = MethodPolicy {
            rate_limit: RateLimitConfig {
                capacity: 5,
                refill_interval: Duration::from_secs(3600),
                mode: LimiterMode::Erroring,
            },
            breaker: BreakerConfig {
                failure_threshold: 3,
                open_timeout: Duration::from_secs(3600),
            },
        };
        let chain = build_server_pipeline(
            FaultyEndpoint {
                calls: Arc::clone(&calls),
            },
            &policy,
            Arc::clone(&key),
        );
        let signed = || {
            let ctx = CallContext::new(methods::HASH)
                .with_bearer(key.mint(Duration::from_secs(30)).unwrap());
            Operation::with_context(ctx, OperationRequest::Hash(HashRequest::new("s")))
        };

        for _ in 0..3 {
            let err = chain.clone().oneshot(signed()).await.unwrap_err();
            assert_eq!(err.kind(), FailureKind::Store);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // Circuit is open; the two remaining tokens go to fast failures.
        for _ in 0..2 {
            let err = chain.clone().oneshot(signed()).await.unwrap_err();
            assert_eq!(err.kind(), FailureKind::CircuitOpen);
        }

        let err = chain.oneshot(signed()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimited);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn breaker_policy_follows_method() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.policy(methods::VALIDATE).breaker,
            BreakerConfig::for_method(methods::VALIDATE)
        );
    }
}
