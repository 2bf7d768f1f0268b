//! HTTP JSON endpoint: the innermost service of a client chain talking to
//! the server's HTTP transport.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tower::Service;
use vault_core::messages::{Failure, FailureKind, HashResponse, ValidateResponse};

use crate::service::{
    CallContext, Operation, OperationError, OperationRequest, OperationResponse,
};
use crate::transport::http::TIMEOUT_HEADER;

/// Sends each operation as one `POST` to `{base_url}/hash` or
/// `{base_url}/validate`.
///
/// Business failures reported by the server come back in-band; every other
/// non-2xx answer becomes the matching `OperationError`.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    base_url: Arc<str>,
}

impl HttpEndpoint {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;
        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        ctx: &CallContext,
        request: OperationRequest,
    ) -> Result<OperationResponse, OperationError> {
        let method = request.method();
        let response = match request {
            OperationRequest::Hash(body) => self
                .post::<_, HashResponse>(ctx, "hash", &body)
                .await?
                .map(OperationResponse::Hash),
            OperationRequest::Validate(body) => self
                .post::<_, ValidateResponse>(ctx, "validate", &body)
                .await?
                .map(OperationResponse::Validate),
        };
        Ok(response.unwrap_or_else(|failure| OperationResponse::failed(method, failure)))
    }

    /// Posts `body` and decodes the reply.
    ///
    /// `Ok(Err(failure))` is an in-band business failure.
    async fn post<B, R>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<Result<R, Failure>, OperationError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut builder = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(body);
        if let Some(bearer) = &ctx.bearer {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Err(OperationError::DeadlineExceeded);
            }
            builder = builder
                .header(TIMEOUT_HEADER, remaining.as_millis().to_string())
                .timeout(remaining);
        }

        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map(Ok).map_err(request_error);
        }

        let failure = decode_failure(status, response).await;
        if failure.is_business() {
            Ok(Err(failure))
        } else {
            Err(OperationError::from_failure(ctx.method, failure))
        }
    }
}

async fn decode_failure(status: StatusCode, response: reqwest::Response) -> Failure {
    match response.json::<Failure>().await {
        Ok(failure) => failure,
        Err(_) => Failure::new(
            FailureKind::Internal,
            format!("server answered HTTP {status} without a failure body"),
        ),
    }
}

fn request_error(e: reqwest::Error) -> OperationError {
    if e.is_timeout() {
        OperationError::DeadlineExceeded
    } else {
        OperationError::Transport(e.to_string())
    }
}

impl Service<Operation> for HttpEndpoint {
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let endpoint = self.clone();
        Box::pin(async move {
            let Operation { ctx, request } = op;
            ctx.run(endpoint.send(&ctx, request)).await
        })
    }
}
