//! Client facade: the same `CredentialService` contract as the server, backed
//! by a client chain (rate limit, breaker, signer, instrumentation) around a
//! remote endpoint.

pub mod http;
pub mod rpc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tower::Service;
use vault_core::SigningKey;

pub use self::http::HttpEndpoint;
pub use self::rpc::RpcEndpoint;
use crate::service::middleware::build_client_router;
use crate::service::{
    CallContext, ClientConfig, CredentialService, Operation, OperationError, OperationResponse,
    OperationRouter,
};

/// Remote credential service.
///
/// Calls without a deadline get `call_timeout`; calls with an earlier one keep
/// it.
#[derive(Clone)]
pub struct VaultClient {
    router: OperationRouter,
    call_timeout: Duration,
}

impl VaultClient {
    /// Client over the HTTP transport at `base_url` (for example
    /// `http://127.0.0.1:8080`).
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn http(
        base_url: impl Into<String>,
        key: Arc<SigningKey>,
        config: &ClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self::with_endpoint(HttpEndpoint::new(base_url)?, &key, config))
    }

    /// Client over one RPC connection to `addr` (`host:port`).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn rpc(
        addr: &str,
        key: Arc<SigningKey>,
        config: &ClientConfig,
    ) -> anyhow::Result<Self> {
        let endpoint = RpcEndpoint::connect(addr, config.max_frame_bytes).await?;
        Ok(Self::with_endpoint(endpoint, &key, config))
    }

    /// Client over any endpoint service.
    #[must_use]
    pub fn with_endpoint<E>(endpoint: E, key: &Arc<SigningKey>, config: &ClientConfig) -> Self
    where
        E: Service<Operation, Response = OperationResponse, Error = OperationError>
            + Clone
            + Send
            + Sync
            + 'static,
        E::Future: Send + 'static,
    {
        Self {
            router: build_client_router(endpoint, &config.pipeline, key, config.token_ttl),
            call_timeout: config.call_timeout,
        }
    }

    fn bounded(&self, ctx: &CallContext) -> CallContext {
        ctx.clone().with_timeout(self.call_timeout)
    }
}

#[async_trait]
impl CredentialService for VaultClient {
    async fn hash(&self, ctx: &CallContext, secret: &str) -> Result<String, OperationError> {
        self.router.hash(&self.bounded(ctx), secret).await
    }

    async fn validate(
        &self,
        ctx: &CallContext,
        secret: &str,
        token: &str,
    ) -> Result<bool, OperationError> {
        self.router.validate(&self.bounded(ctx), secret, token).await
    }
}
