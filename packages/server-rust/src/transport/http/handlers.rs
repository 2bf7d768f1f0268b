//! HTTP JSON handlers: decode, run the chain, map the outcome to a status.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tower::ServiceExt;
use vault_core::messages::{Failure, FailureKind, HashRequest, ValidateRequest};

use crate::service::{CallContext, Operation, OperationRequest, OperationResponse, OperationRouter};
use crate::transport::shutdown::ShutdownController;

/// Header carrying the caller's remaining deadline budget in milliseconds.
pub const TIMEOUT_HEADER: &str = "x-vault-timeout-ms";

/// Shared state passed to all handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Server chains, one per method.
    pub vault: OperationRouter,
    pub shutdown: Arc<ShutdownController>,
    /// Process start time, used for uptime.
    pub start_time: Instant,
}

/// `POST /hash`: `{secret}` -> `{token}` | `{error}`.
pub async fn hash_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<HashRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => dispatch(&state, &headers, OperationRequest::Hash(req)).await,
        Err(rejection) => decode_failure(&rejection),
    }
}

/// `POST /validate`: `{secret, token}` -> `{valid}` | `{error}`.
pub async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ValidateRequest>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(req)) => dispatch(&state, &headers, OperationRequest::Validate(req)).await,
        Err(rejection) => decode_failure(&rejection),
    }
}

/// `GET /health`: always 200; the `state` field tells whether the server is
/// actually serving.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn dispatch(state: &AppState, headers: &HeaderMap, request: OperationRequest) -> Response {
    let _in_flight = state.shutdown.in_flight_guard();
    let ctx = context_from_headers(headers, request.method());
    // Dropping the handler (client went away) cancels the call.
    let _cancel_on_drop = ctx.cancel.clone().drop_guard();

    match state
        .vault
        .clone()
        .oneshot(Operation::with_context(ctx, request))
        .await
    {
        Ok(resp) => response_of(resp),
        Err(e) => failure_response(status_for(e.kind()), &e.to_failure()),
    }
}

fn response_of(resp: OperationResponse) -> Response {
    if let Some(failure) = resp.failure() {
        return failure_response(status_for(failure.kind), failure);
    }
    match resp {
        OperationResponse::Hash(body) => Json(body).into_response(),
        OperationResponse::Validate(body) => Json(body).into_response(),
    }
}

fn decode_failure(rejection: &JsonRejection) -> Response {
    failure_response(
        StatusCode::BAD_REQUEST,
        &Failure::validation(rejection.body_text()),
    )
}

fn failure_response(status: StatusCode, failure: &Failure) -> Response {
    (status, Json(failure)).into_response()
}

/// HTTP status for a failure kind.
#[must_use]
pub fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::Validation => StatusCode::BAD_REQUEST,
        FailureKind::Auth => StatusCode::UNAUTHORIZED,
        FailureKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        FailureKind::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::Primitive
        | FailureKind::Store
        | FailureKind::Cancelled
        | FailureKind::UnknownMethod
        | FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the call context from `Authorization` and the timeout header.
#[must_use]
pub fn context_from_headers(headers: &HeaderMap, method: &'static str) -> CallContext {
    let mut ctx = CallContext::new(method);
    if let Some(token) = bearer_token(headers) {
        ctx = ctx.with_bearer(token);
    }
    let timeout_ms = headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(ms) = timeout_ms {
        ctx = ctx.with_timeout(Duration::from_millis(ms));
    }
    ctx
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(token.trim())
        .filter(|t| !t.is_empty())
}
