//! Circuit breaker for operations.
//!
//! `Closed` counts consecutive faults and opens at the threshold. `Open`
//! rejects every call with `OperationError::CircuitOpen` until the open
//! timeout elapses, then `HalfOpen` admits a single trial: success closes the
//! circuit, failure reopens it. Every transition bumps a generation counter,
//! and outcomes of calls admitted under an older generation are ignored.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info, warn};

use crate::service::config::BreakerConfig;
use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

/// Result of asking the breaker to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Admitted { generation: u64, trial: bool },
}

#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    generation: u64,
    failure_threshold: u32,
    open_timeout: Duration,
}

impl Breaker {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed {
                consecutive_failures: 0,
            },
            generation: 0,
            failure_threshold: config.failure_threshold.max(1),
            open_timeout: config.open_timeout,
        }
    }

    fn transition(&mut self, to: BreakerState) {
        self.state = to;
        self.generation += 1;
    }

    fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed { .. } => Admission::Admitted {
                generation: self.generation,
                trial: false,
            },
            BreakerState::Open { since }
                if now.saturating_duration_since(since) >= self.open_timeout =>
            {
                self.transition(BreakerState::HalfOpen {
                    trial_in_flight: true,
                });
                Admission::Admitted {
                    generation: self.generation,
                    trial: true,
                }
            }
            BreakerState::HalfOpen {
                trial_in_flight: false,
            } => {
                self.state = BreakerState::HalfOpen {
                    trial_in_flight: true,
                };
                Admission::Admitted {
                    generation: self.generation,
                    trial: true,
                }
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen { .. } => Admission::Rejected,
        }
    }

    /// Returns the new state when the outcome caused a transition.
    fn record(&mut self, generation: u64, fault: bool, now: Instant) -> Option<BreakerState> {
        if generation != self.generation {
            return None;
        }
        match (self.state, fault) {
            (BreakerState::Closed { .. }, false) => {
                self.state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
                None
            }
            (BreakerState::Closed { consecutive_failures }, true) => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    self.transition(BreakerState::Open { since: now });
                    Some(self.state)
                } else {
                    self.state = BreakerState::Closed {
                        consecutive_failures: failures,
                    };
                    None
                }
            }
            (BreakerState::HalfOpen { .. }, false) => {
                self.transition(BreakerState::Closed {
                    consecutive_failures: 0,
                });
                Some(self.state)
            }
            (BreakerState::HalfOpen { .. }, true) => {
                self.transition(BreakerState::Open { since: now });
                Some(self.state)
            }
            (BreakerState::Open { .. }, _) => None,
        }
    }
}

/// Whether an outcome counts against the downstream.
fn is_fault(result: &Result<OperationResponse, OperationError>) -> bool {
    match result {
        Ok(resp) => resp.failure().is_some_and(vault_core::Failure::is_fault),
        Err(e) => e.is_fault(),
    }
}

/// Settles the admitted call exactly once; a trial dropped before settling
/// is recorded as a fault.
struct Ticket {
    breaker: Arc<Mutex<Breaker>>,
    method: &'static str,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl Ticket {
    fn settle(&mut self, fault: bool) {
        self.settled = true;
        let transition = self
            .breaker
            .lock()
            .record(self.generation, fault, Instant::now());
        match transition {
            Some(BreakerState::Open { .. }) => {
                warn!(method = self.method, "circuit opened");
            }
            Some(BreakerState::Closed { .. }) => {
                info!(method = self.method, "circuit closed");
            }
            _ => {}
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.settle(true);
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerLayer
// ---------------------------------------------------------------------------

/// Tower layer sharing one breaker among every service it produces.
#[derive(Debug, Clone)]
pub struct CircuitBreakerLayer {
    breaker: Arc<Mutex<Breaker>>,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            breaker: Arc::new(Mutex::new(Breaker::new(config))),
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.breaker.lock().state
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerService
// ---------------------------------------------------------------------------

/// Service wrapper that short-circuits calls while the circuit is open.
#[derive(Debug, Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    breaker: Arc<Mutex<Breaker>>,
}

impl<S> Service<Operation> for CircuitBreakerService<S>
where
    S: Service<Operation, Response = OperationResponse, Error = OperationError> + Send,
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
        let admission = self.breaker.lock().admit(Instant::now());

        let Admission::Admitted { generation, trial } = admission else {
            return Box::pin(async move { Err(OperationError::CircuitOpen { method }) });
        };

        let mut ticket = Ticket {
            breaker: Arc::clone(&self.breaker),
            method,
            generation,
            trial,
            settled: false,
        };
        let fut = self.inner.call(op);
        Box::pin(async move {
            let result = fut.await;
            ticket.settle(is_fault(&result));
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
