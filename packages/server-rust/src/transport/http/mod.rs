//! HTTP JSON transport with deferred startup lifecycle.
//!
//! `new()` wires state, `start()` binds the TCP listener and reports the
//! port, `serve()` accepts connections until the shutdown future resolves.

pub mod handlers;
pub mod middleware;

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

pub use handlers::{AppState, TIMEOUT_HEADER};

use self::handlers::{hash_handler, health_handler, validate_handler};
use self::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::service::{OperationRouter, TransportConfig};

/// Serves `POST /hash`, `POST /validate` and `GET /health`.
pub struct HttpTransport {
    config: TransportConfig,
    vault: OperationRouter,
    shutdown: Arc<ShutdownController>,
    listener: Option<TcpListener>,
}

impl HttpTransport {
    /// Creates the transport without binding any port.
    #[must_use]
    pub fn new(
        config: TransportConfig,
        vault: OperationRouter,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        Self {
            config,
            vault,
            shutdown,
            listener: None,
        }
    }

    /// Assembles the axum router with all routes and middleware.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            vault: self.vault.clone(),
            shutdown: Arc::clone(&self.shutdown),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/hash", post(hash_handler))
            .route("/validate", post(validate_handler))
            .route("/health", get(health_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener to `config.http_addr`.
    ///
    /// Returns the bound port, which differs from the configured one when
    /// port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(&self.config.http_addr).await?;
        let port = listener.local_addr()?.port();
        info!(addr = %self.config.http_addr, port, "HTTP listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves requests until `shutdown` resolves, then lets in-flight
    /// requests finish.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server hits a
    /// fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router();

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP transport stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use vault_core::auth::DEFAULT_KEY_ID;
    use vault_core::SigningKey;

    use super::*;
    use crate::service::credential::tests::PlainPrimitive;
    use crate::service::middleware::build_server_router;
    use crate::service::{LimiterMode, PipelineConfig, RateLimitConfig, VaultService};
    use crate::store::MemoryStore;

    fn key() -> Arc<SigningKey> {
        Arc::new(SigningKey::new(DEFAULT_KEY_ID, "zmh298onj30"))
    }

    fn transport(key: &Arc<SigningKey>) -> HttpTransport {
        let service = Arc::new(VaultService::new(
            PlainPrimitive,
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
        ));
        let config = PipelineConfig::with_limiter(RateLimitConfig {
            capacity: 100,
            refill_interval: Duration::from_millis(10),
            mode: LimiterMode::Erroring,
        });
        HttpTransport::new(
            TransportConfig {
                http_addr: "127.0.0.1:0".to_string(),
                ..TransportConfig::default()
            },
            build_server_router(service, &config, key),
            Arc::new(ShutdownController::new()),
        )
    }

    async fn send(router: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post(path: &str, bearer: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::post(path).header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn hash_returns_token() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let router = transport(&key).build_router();

        let (status, body) = send(router, post("/hash", Some(&token), r#"{"secret":"abc"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"token": "plain:abc"}));
    }

    #[tokio::test]
    async fn validate_returns_valid_flag() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let router = transport(&key).build_router();

        let (status, body) = send(
            router,
            post("/validate", Some(&token), r#"{"secret":"abc","token":"plain:abc"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"valid": true}));
    }

    #[tokio::test]
    async fn missing_bearer_is_401() {
        let router = transport(&key()).build_router();
        let (status, body) = send(router, post("/hash", None, r#"{"secret":"abc"}"#)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "auth");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn undecodable_body_is_400() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let router = transport(&key).build_router();

        let (status, body) = send(router, post("/hash", Some(&token), "{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn in_band_validation_failure_is_400() {
        let key = key();
        let token = key.mint(Duration::from_secs(30)).unwrap();
        let router = transport(&key).build_router();

        let (status, body) = send(router, post("/hash", Some(&token), r#"{"secret":""}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn health_reports_state() {
        let router = transport(&key()).build_router();
        let req = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(router, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "starting");
        assert_eq!(body["in_flight"], 0);
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut transport = transport(&key());
        let port = transport.start().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let transport = transport(&key());
        assert!(transport.serve(std::future::ready(())).await.is_err());
    }
}
