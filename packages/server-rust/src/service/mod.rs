//! Credential operations and the request pipeline around them.
//!
//! 1. **Operation** (`operation`): call context, request/response, error taxonomy
//! 2. **Credential service** (`credential`): `Hash` / `Validate` business logic
//! 3. **Endpoint** (`endpoint`): adapts a credential service to `tower::Service`
//! 4. **Middleware** (`middleware`): Tower layers (rate limit, breaker, auth, instrumentation)
//! 5. **Routing** (`router`): Dispatch to the chain of each method

pub mod config;
pub mod credential;
pub mod endpoint;
pub mod middleware;
pub mod operation;
pub mod router;

// Re-export key types for convenient access.
pub use config::{
    BreakerConfig, ClientConfig, LimiterMode, MethodPolicy, PipelineConfig, RateLimitConfig,
    TransportConfig, VaultConfig,
};
pub use credential::{CredentialService, VaultService};
pub use endpoint::CredentialEndpoint;
pub use operation::{
    methods, CallContext, Operation, OperationError, OperationRequest, OperationResponse,
};
pub use router::{BoxOperationService, OperationRouter};
