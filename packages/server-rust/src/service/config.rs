//! Configuration for the vault service, its decorator chains and transports.
//!
//! Server and client chains share the same shapes but not the same defaults:
//! the server throttles and rejects, the client waits for its turn at the
//! server's rate.

use std::time::Duration;

use vault_core::auth::DEFAULT_KEY_ID;
use vault_core::primitive::DEFAULT_COST;

use super::operation::methods;

/// What the rate limiter does when no token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterMode {
    /// Fail the call with `RateLimited` without invoking the inner service.
    Erroring,
    /// Reserve the next token and wait for it.
    Delaying,
}

/// Token-bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Bucket size; also the initial token count.
    pub capacity: u32,
    /// Time to refill one token.
    pub refill_interval: Duration,
    pub mode: LimiterMode,
}

impl RateLimitConfig {
    /// One call per second with a burst of two, rejecting.
    ///
    /// The spare token absorbs latency jitter between a paced client and the
    /// server, so a client running [`client`](Self::client) is never refused.
    #[must_use]
    pub fn server() -> Self {
        Self {
            capacity: 2,
            refill_interval: Duration::from_secs(1),
            mode: LimiterMode::Erroring,
        }
    }

    /// One call per second, no burst, waiting. Paces calls to the server's
    /// sustained rate.
    #[must_use]
    pub fn client() -> Self {
        Self {
            capacity: 1,
            refill_interval: Duration::from_secs(1),
            mode: LimiterMode::Delaying,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::server()
    }
}

/// Circuit-breaker parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive faults that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a trial call.
    pub open_timeout: Duration,
}

impl BreakerConfig {
    #[must_use]
    pub fn for_method(method: &str) -> Self {
        if method == methods::VALIDATE {
            Self {
                failure_threshold: 3,
                open_timeout: Duration::from_secs(10),
            }
        } else {
            Self {
                failure_threshold: 5,
                open_timeout: Duration::from_secs(30),
            }
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::for_method(methods::HASH)
    }
}

/// Decorator settings for one method's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPolicy {
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
}

/// Decorator settings for every method of one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub hash: MethodPolicy,
    pub validate: MethodPolicy,
}

impl PipelineConfig {
    #[must_use]
    pub fn server() -> Self {
        Self::with_limiter(RateLimitConfig::server())
    }

    #[must_use]
    pub fn client() -> Self {
        Self::with_limiter(RateLimitConfig::client())
    }

    /// Same limiter for every method, per-method breaker defaults.
    #[must_use]
    pub fn with_limiter(rate_limit: RateLimitConfig) -> Self {
        Self {
            hash: MethodPolicy {
                rate_limit: rate_limit.clone(),
                breaker: BreakerConfig::for_method(methods::HASH),
            },
            validate: MethodPolicy {
                rate_limit,
                breaker: BreakerConfig::for_method(methods::VALIDATE),
            },
        }
    }

    /// Policy for `method`; unknown methods get the `Hash` policy.
    #[must_use]
    pub fn policy(&self, method: &str) -> &MethodPolicy {
        if method == methods::VALIDATE {
            &self.validate
        } else {
            &self.hash
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::server()
    }
}

/// Listen addresses and HTTP limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// `host:port` for the HTTP JSON transport. Port 0 means OS-assigned.
    pub http_addr: String,
    /// `host:port` for the binary RPC transport. Port 0 means OS-assigned.
    pub rpc_addr: String,
    /// Maximum time an HTTP request may take end to end.
    pub request_timeout: Duration,
    /// Maximum accepted request body (HTTP) or frame (RPC) size.
    pub max_body_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            rpc_addr: "0.0.0.0:8081".to_string(),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 64 * 1024,
        }
    }
}

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    /// bcrypt cost factor.
    pub cost: u32,
    /// Upper bound on waiting for a store acknowledgement.
    pub store_timeout: Duration,
    /// Expected `kid` of inbound bearer tokens.
    pub key_id: String,
    pub pipeline: PipelineConfig,
    pub transport: TransportConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            cost: DEFAULT_COST,
            store_timeout: Duration::from_secs(1),
            key_id: DEFAULT_KEY_ID.to_string(),
            pipeline: PipelineConfig::server(),
            transport: TransportConfig::default(),
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Lifetime of each minted bearer token.
    pub token_ttl: Duration,
    /// Deadline applied to calls that do not carry one.
    pub call_timeout: Duration,
    /// Largest RPC frame the client accepts.
    pub max_frame_bytes: usize,
    pub pipeline: PipelineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
            pipeline: PipelineConfig::client(),
        }
    }
}
