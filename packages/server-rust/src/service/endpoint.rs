//! Innermost service of every server chain: adapts a [`CredentialService`]
//! to `tower::Service<Operation>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;
use vault_core::messages::{HashResponse, ValidateResponse};

use super::credential::CredentialService;
use super::operation::{Operation, OperationError, OperationRequest, OperationResponse};

/// Calls the credential service and moves business failures in-band.
///
/// `Validation`, `Primitive` and `Store` errors become the response's
/// `failure`; every other error stays an `Err`.
pub struct CredentialEndpoint<C: ?Sized> {
    service: Arc<C>,
}

impl<C: ?Sized> CredentialEndpoint<C> {
    #[must_use]
    pub fn new(service: Arc<C>) -> Self {
        Self { service }
    }
}

impl<C: ?Sized> Clone for CredentialEndpoint<C> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

impl<C> Service<Operation> for CredentialEndpoint<C>
where
    C: CredentialService + ?Sized + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let service = Arc::clone(&self.service);
        Box::pin(async move {
            let Operation { ctx, request } = op;
            let method = request.method();
            let outcome = match request {
                OperationRequest::Hash(req) => service
                    .hash(&ctx, &req.secret)
                    .await
                    .map(|token| OperationResponse::Hash(HashResponse::ok(token))),
                OperationRequest::Validate(req) => service
                    .validate(&ctx, &req.secret, &req.token)
                    .await
                    .map(|valid| OperationResponse::Validate(ValidateResponse::ok(valid))),
            };

            match outcome {
                Err(e) if e.is_business() => Ok(OperationResponse::failed(method, e.to_failure())),
                other => other,
            }
        })
    }
}
