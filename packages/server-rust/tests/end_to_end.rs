//! Full client/server round trips over real sockets bound to port 0.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use vault_core::auth::DEFAULT_KEY_ID;
use vault_core::messages::{FailureKind, RpcResponse};
use vault_core::{BcryptPrimitive, SigningKey};
use vault_server::service::middleware::build_server_router;
use vault_server::service::{
    methods, LimiterMode, PipelineConfig, RateLimitConfig, TransportConfig, VaultConfig,
};
use vault_server::transport::frame_codec;
use vault_server::{
    CallContext, ClientConfig, CredentialService, HttpTransport, MemoryStore, OperationError,
    RpcTransport, ShutdownController, VaultClient, VaultService,
};

const SECRET: &str = "znm9832nmrfz4egwy43rn8";

struct Server {
    http_port: u16,
    rpc_port: u16,
    store: Arc<MemoryStore>,
    shutdown: Arc<ShutdownController>,
}

impl Server {
    async fn start(key: &Arc<SigningKey>) -> Self {
        let roomy = PipelineConfig::with_limiter(RateLimitConfig {
            capacity: 100,
            refill_interval: Duration::from_millis(10),
            mode: LimiterMode::Erroring,
        });
        Self::start_with(key, &roomy).await
    }

    async fn start_with(key: &Arc<SigningKey>, pipeline: &PipelineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(VaultService::new(
            BcryptPrimitive::new(4),
            Arc::clone(&store),
            Duration::from_secs(1),
        ));
        let router = build_server_router(service, pipeline, key);
        let shutdown = Arc::new(ShutdownController::new());
        let transport = TransportConfig {
            http_addr: "127.0.0.1:0".to_string(),
            rpc_addr: "127.0.0.1:0".to_string(),
            ..TransportConfig::default()
        };

        let mut http = HttpTransport::new(transport.clone(), router.clone(), Arc::clone(&shutdown));
        let mut rpc = RpcTransport::new(transport, router, Arc::clone(&shutdown));
        let http_port = http.start().await.unwrap();
        let rpc_port = rpc.start().await.unwrap();

        let token = shutdown.shutdown_token();
        let http_stop = token.clone();
        tokio::spawn(http.serve(async move { http_stop.cancelled().await }));
        tokio::spawn(rpc.serve(async move { token.cancelled().await }));
        shutdown.set_ready();

        Self {
            http_port,
            rpc_port,
            store,
            shutdown,
        }
    }

    fn http_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.http_port)
    }

    fn rpc_addr(&self) -> String {
        format!("127.0.0.1:{}", self.rpc_port)
    }
}

fn key() -> Arc<SigningKey> {
    Arc::new(SigningKey::new(DEFAULT_KEY_ID, "zmh298onj30"))
}

async fn assert_round_trip(client: &VaultClient) {
    let ctx = CallContext::new(methods::HASH);
    let token = client.hash(&ctx, SECRET).await.unwrap();
    assert!(token.starts_with("$2b$"), "unexpected token {token}");
    assert!(client.validate(&ctx, SECRET, &token).await.unwrap());
    assert!(!client.validate(&ctx, "wrong", &token).await.unwrap());
}

#[tokio::test]
async fn http_client_round_trip() {
    let key = key();
    let server = Server::start(&key).await;
    let client = VaultClient::http(server.http_url(), Arc::clone(&key), &ClientConfig::default())
        .unwrap();

    assert_round_trip(&client).await;
    assert_eq!(server.store.len(), 1);
}

#[tokio::test]
async fn rpc_client_round_trip() {
    let key = key();
    let server = Server::start(&key).await;
    let client = VaultClient::rpc(&server.rpc_addr(), Arc::clone(&key), &ClientConfig::default())
        .await
        .unwrap();

    assert_round_trip(&client).await;
    assert_eq!(server.store.len(), 1);
}

#[tokio::test]
async fn default_limits_admit_a_default_client() {
    let key = key();
    let server = Server::start_with(&key, &VaultConfig::default().pipeline).await;
    let config = ClientConfig::default();

    let http = VaultClient::http(server.http_url(), Arc::clone(&key), &config).unwrap();
    assert_round_trip(&http).await;

    let rpc = VaultClient::rpc(&server.rpc_addr(), Arc::clone(&key), &config)
        .await
        .unwrap();
    let token = rpc
        .hash(&CallContext::new(methods::HASH), SECRET)
        .await
        .unwrap();
    assert!(!rpc.validate(&CallContext::new(methods::VALIDATE), "wrong", &token).await.unwrap());
}

#[tokio::test]
async fn tokens_cross_transports() {
    let key = key();
    let server = Server::start(&key).await;
    let config = ClientConfig::default();
    let http = VaultClient::http(server.http_url(), Arc::clone(&key), &config).unwrap();
    let rpc = VaultClient::rpc(&server.rpc_addr(), Arc::clone(&key), &config)
        .await
        .unwrap();

    let ctx = CallContext::new(methods::HASH);
    let token = http.hash(&ctx, SECRET).await.unwrap();
    assert!(rpc.validate(&ctx, SECRET, &token).await.unwrap());
}

#[tokio::test]
async fn wrong_signing_key_is_an_auth_error_on_both_transports() {
    let server = Server::start(&key()).await;
    let other = Arc::new(SigningKey::new(DEFAULT_KEY_ID, "not-the-server-key"));
    let config = ClientConfig::default();
    let ctx = CallContext::new(methods::HASH);

    let http = VaultClient::http(server.http_url(), Arc::clone(&other), &config).unwrap();
    let err = http.hash(&ctx, SECRET).await.unwrap_err();
    assert!(matches!(err, OperationError::Auth(_)), "got {err:?}");

    let rpc = VaultClient::rpc(&server.rpc_addr(), other, &config)
        .await
        .unwrap();
    let err = rpc.hash(&ctx, SECRET).await.unwrap_err();
    assert!(matches!(err, OperationError::Auth(_)), "got {err:?}");
}

#[tokio::test]
async fn empty_secret_is_a_validation_error() {
    let key = key();
    let server = Server::start(&key).await;
    let client = VaultClient::http(server.http_url(), key, &ClientConfig::default()).unwrap();

    let err = client
        .hash(&CallContext::new(methods::HASH), "")
        .await
        .unwrap_err();
    assert!(matches!(err, OperationError::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn raw_http_statuses() {
    let key = key();
    let server = Server::start(&key).await;
    let http = reqwest::Client::new();

    let unsigned = http
        .post(format!("{}/hash", server.http_url()))
        .json(&serde_json::json!({"secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = unsigned.json().await.unwrap();
    assert_eq!(body["kind"], "auth");

    let garbled = http
        .post(format!("{}/validate", server.http_url()))
        .bearer_auth(key.mint(Duration::from_secs(30)).unwrap())
        .header("content-type", "application/json")
        .body("{\"secret\":")
        .send()
        .await
        .unwrap();
    assert_eq!(garbled.status(), reqwest::StatusCode::BAD_REQUEST);

    let health: serde_json::Value = http
        .get(format!("{}/health", server.http_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["state"], "ready");
}

#[tokio::test]
async fn garbage_rpc_frame_gets_validation_error() {
    let server = Server::start(&key()).await;
    let stream = TcpStream::connect(server.rpc_addr()).await.unwrap();
    let mut conn = Framed::new(stream, frame_codec(64 * 1024));

    conn.send(Bytes::from_static(b"not msgpack at all")).await.unwrap();
    let frame = conn.next().await.unwrap().unwrap();
    let response = RpcResponse::from_slice(&frame).unwrap();
    assert_eq!(response.id, 0);
    assert_eq!(response.error.unwrap().kind, FailureKind::Validation);
}

#[tokio::test]
async fn shutdown_drains_and_reports_stopped() {
    let key = key();
    let server = Server::start(&key).await;
    let client = VaultClient::http(server.http_url(), key, &ClientConfig::default()).unwrap();
    client
        .hash(&CallContext::new(methods::HASH), SECRET)
        .await
        .unwrap();

    server.shutdown.trigger_shutdown();
    assert!(server.shutdown.wait_for_drain(Duration::from_secs(5)).await);
    assert_eq!(server.shutdown.health_state().as_str(), "stopped");
}
