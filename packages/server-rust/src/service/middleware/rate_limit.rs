//! Token-bucket rate limiting for operations.
//!
//! One bucket is shared by every clone of a chain. In `Erroring` mode an empty
//! bucket rejects the call with `OperationError::RateLimited`; in `Delaying`
//! mode the call reserves the next token and waits for it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::debug;

use crate::service::config::{LimiterMode, RateLimitConfig};
use crate::service::operation::{Operation, OperationError, OperationResponse};

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Bucket state. Tokens may go negative: each outstanding reservation owes one.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    refill_interval: Duration,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn new(capacity: u32, refill_interval: Duration, now: Instant) -> Self {
        Self {
            capacity: f64::from(capacity.max(1)),
            refill_interval: refill_interval.max(Duration::from_nanos(1)),
            tokens: f64::from(capacity.max(1)),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
        self.tokens = (self.tokens + earned).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token if one is available right now.
    pub(crate) fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token unconditionally; returns how long until it matures.
    pub(crate) fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            self.refill_interval.mul_f64(-self.tokens)
        }
    }

    /// Give back a reserved token that was never used.
    pub(crate) fn release(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    #[cfg(test)]
    fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }
}

/// A reserved token that goes back to the bucket unless consumed.
struct Reservation {
    bucket: Arc<Mutex<TokenBucket>>,
    armed: bool,
}

impl Reservation {
    fn consume(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.lock().release();
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer applying a shared token bucket to every call.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    bucket: Arc<Mutex<TokenBucket>>,
    mode: LimiterMode,
}

impl RateLimitLayer {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(
                config.capacity,
                config.refill_interval,
                Instant::now(),
            ))),
            mode: config.mode,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
            mode: self.mode,
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitService
// ---------------------------------------------------------------------------

/// Service wrapper that admits calls at the bucket's rate.
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<Mutex<TokenBucket>>,
    mode: LimiterMode,
}

impl<S> Service<Operation> for RateLimitService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = OperationResponse;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<OperationResponse, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, op: Operation) -> Self::Future {
        let method = op.method();

        if self.mode == LimiterMode::Erroring {
            if !self.bucket.lock().try_acquire(Instant::now()) {
                debug!(method, call_id = op.ctx.call_id, "rate limited");
                return Box::pin(async move { Err(OperationError::RateLimited { method }) });
            }
            return Box::pin(self.inner.call(op));
        }

        let wait = self.bucket.lock().reserve(Instant::now());
        let reservation = Reservation {
            bucket: Arc::clone(&self.bucket),
            armed: true,
        };

        if wait.is_zero() {
            reservation.consume();
            return Box::pin(self.inner.call(op));
        }

        if op.ctx.remaining().is_some_and(|left| wait > left) {
            debug!(method, call_id = op.ctx.call_id, ?wait, "limiter wait overruns deadline");
            drop(reservation);
            return Box::pin(async { Err(OperationError::DeadlineExceeded) });
        }

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let cancel = op.ctx.cancel.clone();
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(OperationError::Cancelled),
                () = tokio::time::sleep(wait) => {
                    reservation.consume();
                    inner.call(op).await
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
