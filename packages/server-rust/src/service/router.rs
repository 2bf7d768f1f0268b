//! Operation routing: dispatches an `Operation` to the chain of its method.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceExt};
use vault_core::messages::{HashRequest, ValidateRequest};

use super::credential::CredentialService;
use super::operation::{
    methods, CallContext, Operation, OperationError, OperationRequest, OperationResponse,
};

/// A type-erased, cloneable chain handling one method.
pub type BoxOperationService = BoxCloneSyncService<Operation, OperationResponse, OperationError>;

// ---------------------------------------------------------------------------
// OperationRouter
// ---------------------------------------------------------------------------

/// Routes `Operation` values to the chain registered for their method.
///
/// Clones share the registered chains, and therefore their decorator state.
/// Operations for an unregistered method fail with
/// `OperationError::UnknownMethod`.
#[derive(Clone, Default)]
pub struct OperationRouter {
    services: HashMap<&'static str, BoxOperationService>,
}

impl OperationRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the chain for `method`, replacing any previous one.
    pub fn register<S>(&mut self, method: &'static str, service: S)
    where
        S: Service<Operation, Response = OperationResponse, Error = OperationError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.services.insert(method, BoxCloneSyncService::new(service));
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &'static str,
        request: OperationRequest,
    ) -> Result<OperationResponse, OperationError> {
        let svc = self
            .services
            .get(method)
            .cloned()
            .ok_or_else(|| OperationError::UnknownMethod {
                method: method.to_string(),
            })?;
        let mut ctx = ctx.clone();
        ctx.method = method;
        svc.oneshot(Operation::with_context(ctx, request)).await
    }
}

impl Service<Operation> for OperationRouter {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each call drives its own clone of the target chain to readiness.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let method = op.method();
        match self.services.get(method) {
            Some(svc) => Box::pin(svc.clone().oneshot(op)),
            None => Box::pin(async move {
                Err(OperationError::UnknownMethod {
                    method: method.to_string(),
                })
            }),
        }
    }
}

#[async_trait]
impl CredentialService for OperationRouter {
    async fn hash(&self, ctx: &CallContext, secret: &str) -> Result<String, OperationError> {
        let request = OperationRequest::Hash(HashRequest::new(secret));
        match self.dispatch(ctx, methods::HASH, request).await? {
            OperationResponse::Hash(resp) => resp
                .into_result()
                .map_err(|f| OperationError::from_failure(methods::HASH, f)),
            OperationResponse::Validate(_) => Err(OperationError::Internal(anyhow::anyhow!(
                "Hash chain answered with a Validate response"
            ))),
        }
    }

    async fn validate(
        &self,
        ctx: &CallContext,
        secret: &str,
        token: &str,
    ) -> Result<bool, OperationError> {
        let request = OperationRequest::Validate(ValidateRequest::new(secret, token));
        match self.dispatch(ctx, methods::VALIDATE, request).await? {
            OperationResponse::Validate(resp) => resp
                .into_result()
                .map_err(|f| OperationError::from_failure(methods::VALIDATE, f)),
            OperationResponse::Hash(_) => Err(OperationError::Internal(anyhow::anyhow!(
                "Validate chain answered with a Hash response"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
