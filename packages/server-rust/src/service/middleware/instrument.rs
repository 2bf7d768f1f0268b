//! Instrumentation middleware for operations.
//!
//! Records call duration and outcome with the `metrics` facade and emits one
//! structured `tracing` event per call. Never alters the result.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::time::Instant;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};
use vault_core::messages::FailureKind;

use crate::service::operation::{Operation, OperationError, OperationResponse};

/// Histogram of call durations in seconds.
pub const REQUEST_DURATION: &str = "vault_request_duration_seconds";
/// Counter of completed calls.
pub const REQUESTS_TOTAL: &str = "vault_requests_total";

/// Register metric descriptions with the installed recorder, if any.
pub fn describe_metrics() {
    metrics::describe_histogram!(
        REQUEST_DURATION,
        metrics::Unit::Seconds,
        "Vault operation duration in seconds"
    );
    metrics::describe_counter!(REQUESTS_TOTAL, "Total number of vault operations");
}

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments operations; `role` labels server or client.
#[derive(Debug, Clone)]
pub struct InstrumentLayer {
    role: &'static str,
}

impl InstrumentLayer {
    #[must_use]
    pub fn new(role: &'static str) -> Self {
        Self { role }
    }
}

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService {
            inner,
            role: self.role,
        }
    }
}

// ---------------------------------------------------------------------------
// InstrumentService
// ---------------------------------------------------------------------------

/// Service wrapper that records duration and outcome of every call.
#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
    role: &'static str,
}

impl<S> Service<Operation> for InstrumentService<S>
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
        let role = self.role;
        let call_id = op.ctx.call_id;
        let input = op.request.masked();
        let key_id = op
            .ctx
            .claims
            .as_ref()
            .and_then(|c| c.key_id.clone())
            .unwrap_or_default();

        let span = info_span!("operation", method, role, call_id);
        let fut = self.inner.call(op);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let (kind, failure) = match &result {
                    Ok(resp) => (
                        resp.failure().map(|f| f.kind),
                        resp.failure().map(ToString::to_string),
                    ),
                    Err(e) => (Some(e.kind()), Some(e.to_string())),
                };
                let success = if failure.is_none() { "true" } else { "false" };

                metrics::histogram!(
                    REQUEST_DURATION,
                    "method" => method,
                    "role" => role,
                    "success" => success
                )
                .record(elapsed.as_secs_f64());
                metrics::counter!(
                    REQUESTS_TOTAL,
                    "method" => method,
                    "role" => role,
                    "success" => success
                )
                .increment(1);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::info!(
                    input = %input,
                    key_id = %key_id,
                    success,
                    kind = kind.map_or("", FailureKind::as_str),
                    failure = failure.as_deref().unwrap_or(""),
                    duration_ms,
                    "operation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
