//! The credential service: business logic of `Hash` and `Validate`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use vault_core::primitive::MAX_SECRET_BYTES;
use vault_core::CredentialPrimitive;

use super::operation::{CallContext, OperationError};
use crate::store::{SecretStore, StoreError};

/// The two credential operations.
///
/// Implemented by the local [`VaultService`], by the dispatching router and by
/// the remote client facade, so callers cannot tell them apart.
#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Derive a token from `secret` and persist it.
    async fn hash(&self, ctx: &CallContext, secret: &str) -> Result<String, OperationError>;

    /// Check `secret` against `token`. A mismatch is `Ok(false)`.
    async fn validate(
        &self,
        ctx: &CallContext,
        secret: &str,
        token: &str,
    ) -> Result<bool, OperationError>;
}

#[async_trait]
impl<T: CredentialService + ?Sized> CredentialService for Arc<T> {
    async fn hash(&self, ctx: &CallContext, secret: &str) -> Result<String, OperationError> {
        (**self).hash(ctx, secret).await
    }

    async fn validate(
        &self,
        ctx: &CallContext,
        secret: &str,
        token: &str,
    ) -> Result<bool, OperationError> {
        (**self).validate(ctx, secret, token).await
    }
}

// ---------------------------------------------------------------------------
// VaultService
// ---------------------------------------------------------------------------

/// Local implementation over a credential primitive and a secret store.
pub struct VaultService<P, S> {
    primitive: Arc<P>,
    store: Arc<S>,
    store_timeout: Duration,
}

impl<P, S> VaultService<P, S>
where
    P: CredentialPrimitive,
    S: SecretStore,
{
    #[must_use]
    pub fn new(primitive: P, store: Arc<S>, store_timeout: Duration) -> Self {
        Self {
            primitive: Arc::new(primitive),
            store,
            store_timeout,
        }
    }

    async fn keep(&self, token: &str) -> Result<(), OperationError> {
        let write = self.store.keep_secret(token.as_bytes().to_vec());
        match tokio::time::timeout(self.store_timeout, write).await {
            Ok(result) => result.map_err(OperationError::Store),
            Err(_elapsed) => Err(OperationError::Store(StoreError::TimedOut)),
        }
    }
}

fn check_secret(secret: &str) -> Result<(), OperationError> {
    if secret.is_empty() {
        return Err(OperationError::Validation("secret must not be empty".into()));
    }
    if secret.len() > MAX_SECRET_BYTES {
        return Err(OperationError::Validation(format!(
            "secret exceeds {MAX_SECRET_BYTES} bytes"
        )));
    }
    Ok(())
}

#[async_trait]
impl<P, S> CredentialService for VaultService<P, S>
where
    P: CredentialPrimitive,
    S: SecretStore,
{
    async fn hash(&self, ctx: &CallContext, secret: &str) -> Result<String, OperationError> {
        check_secret(secret)?;

        let primitive = Arc::clone(&self.primitive);
        let secret = secret.to_owned();
        let token = ctx
            .run(async move {
                tokio::task::spawn_blocking(move || primitive.derive(&secret))
                    .await
                    .map_err(|e| OperationError::Internal(e.into()))?
                    .map_err(OperationError::Primitive)
            })
            .await?;

        ctx.run(self.keep(&token)).await?;
        debug!(call_id = ctx.call_id, "token derived and stored");
        Ok(token)
    }

    async fn validate(
        &self,
        ctx: &CallContext,
        secret: &str,
        token: &str,
    ) -> Result<bool, OperationError> {
        check_secret(secret)?;
        if token.is_empty() {
            return Err(OperationError::Validation("token must not be empty".into()));
        }

        let primitive = Arc::clone(&self.primitive);
        let secret = secret.to_owned();
        let token = token.to_owned();
        let valid = ctx
            .run(async move {
                tokio::task::spawn_blocking(move || primitive.verify(&secret, &token))
                    .await
                    .map_err(|e| OperationError::Internal(e.into()))
            })
            .await?;

        debug!(call_id = ctx.call_id, valid, "secret checked");
        Ok(valid)
    }
}
