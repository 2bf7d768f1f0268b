//! Tower middleware layers for the operation pipeline.
//!
//! - [`rate_limit`]: Token-bucket limiting, erroring or delaying
//! - [`circuit_breaker`]: Fault isolation per method
//! - [`auth`]: Bearer-token verification (server role)
//! - [`signer`]: Bearer-token minting (client role)
//! - [`instrument`]: Duration/outcome metrics and structured logging
//! - [`pipeline`]: Composes the layers into per-method chains

pub mod auth;
pub mod circuit_breaker;
pub mod instrument;
pub mod pipeline;
pub mod rate_limit;
pub mod signer;

pub use auth::AuthLayer;
pub use circuit_breaker::{BreakerState, CircuitBreakerLayer};
pub use instrument::{describe_metrics, InstrumentLayer};
pub use pipeline::{
    build_client_pipeline, build_client_router, build_server_pipeline, build_server_router,
};
pub use rate_limit::RateLimitLayer;
pub use signer::SignerLayer;
