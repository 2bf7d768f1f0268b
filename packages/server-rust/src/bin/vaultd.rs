//! `vaultd`: serves the credential vault over HTTP and RPC until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};
use vault_core::auth::DEFAULT_KEY_ID;
use vault_core::primitive::{DEFAULT_COST, MAX_COST, MIN_COST};
use vault_core::{BcryptPrimitive, SigningKey};
use vault_server::service::middleware::build_server_router;
use vault_server::service::{MethodPolicy, PipelineConfig, TransportConfig, VaultConfig};
use vault_server::store::SecretStore;
use vault_server::telemetry::{init_tracing, LogFormat};
use vault_server::{HttpTransport, MemoryStore, RpcTransport, ShutdownController, VaultService};

/// Upper bound on waiting for in-flight calls after Ctrl-C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "vaultd", version, about = "Credential vault server")]
struct Args {
    /// HTTP JSON listen address.
    #[arg(long, env = "VAULT_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Binary RPC listen address.
    #[arg(long, env = "VAULT_RPC_ADDR", default_value = "0.0.0.0:8081")]
    rpc_addr: String,

    /// HMAC secret shared with clients for bearer tokens.
    #[arg(long, env = "VAULT_SIGNING_KEY", hide_env_values = true)]
    signing_key: String,

    /// Expected `kid` header of bearer tokens.
    #[arg(long, env = "VAULT_KEY_ID", default_value = DEFAULT_KEY_ID)]
    key_id: String,

    /// bcrypt cost factor.
    #[arg(
        long,
        env = "VAULT_COST",
        default_value_t = DEFAULT_COST,
        value_parser = clap::value_parser!(u32).range(i64::from(MIN_COST)..=i64::from(MAX_COST)),
    )]
    cost: u32,

    /// Burst size of each method's rate limiter.
    #[arg(
        long,
        env = "VAULT_RATE_CAPACITY",
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    rate_capacity: Option<u32>,

    /// Milliseconds to refill one rate-limiter token.
    #[arg(
        long,
        env = "VAULT_RATE_INTERVAL_MS",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    rate_interval_ms: Option<u64>,

    /// Consecutive faults that open a method's circuit.
    #[arg(
        long,
        env = "VAULT_BREAKER_THRESHOLD",
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    breaker_threshold: Option<u32>,

    /// Milliseconds an open circuit waits before a trial call.
    #[arg(long, env = "VAULT_BREAKER_TIMEOUT_MS")]
    breaker_timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Postgres URL; tokens are kept in memory when absent.
    #[cfg(feature = "postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

impl Args {
    fn vault_config(&self) -> VaultConfig {
        let mut pipeline = PipelineConfig::server();
        for policy in [&mut pipeline.hash, &mut pipeline.validate] {
            self.apply_overrides(policy);
        }
        VaultConfig {
            cost: self.cost,
            key_id: self.key_id.clone(),
            pipeline,
            transport: TransportConfig {
                http_addr: self.http_addr.clone(),
                rpc_addr: self.rpc_addr.clone(),
                ..TransportConfig::default()
            },
            ..VaultConfig::default()
        }
    }

    /// Flags that are set replace the per-method defaults of every method.
    fn apply_overrides(&self, policy: &mut MethodPolicy) {
        if let Some(capacity) = self.rate_capacity {
            policy.rate_limit.capacity = capacity;
        }
        if let Some(ms) = self.rate_interval_ms {
            policy.rate_limit.refill_interval = Duration::from_millis(ms);
        }
        if let Some(threshold) = self.breaker_threshold {
            policy.breaker.failure_threshold = threshold;
        }
        if let Some(ms) = self.breaker_timeout_ms {
            policy.breaker.open_timeout = Duration::from_millis(ms);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format, None)?;
    let config = args.vault_config();

    run(&args, config).await
}

#[cfg(feature = "postgres")]
async fn run(args: &Args, config: VaultConfig) -> anyhow::Result<()> {
    if let Some(url) = &args.database_url {
        let store = vault_server::store::PostgresStore::connect(url)
            .await
            .context("failed to connect to Postgres")?;
        store
            .initialize()
            .await
            .context("failed to initialize the secret table")?;
        info!("keeping tokens in Postgres");
        return serve(config, &args.signing_key, Arc::new(store)).await;
    }
    info!("keeping tokens in memory");
    serve(config, &args.signing_key, Arc::new(MemoryStore::new())).await
}

#[cfg(not(feature = "postgres"))]
async fn run(args: &Args, config: VaultConfig) -> anyhow::Result<()> {
    info!("keeping tokens in memory");
    serve(config, &args.signing_key, Arc::new(MemoryStore::new())).await
}

async fn serve<S: SecretStore>(
    config: VaultConfig,
    signing_key: &str,
    store: Arc<S>,
) -> anyhow::Result<()> {
    let key = Arc::new(SigningKey::new(config.key_id.clone(), signing_key));
    let service = Arc::new(VaultService::new(
        BcryptPrimitive::new(config.cost),
        store,
        config.store_timeout,
    ));
    let router = build_server_router(service, &config.pipeline, &key);
    let shutdown = Arc::new(ShutdownController::new());

    let mut http =
        HttpTransport::new(config.transport.clone(), router.clone(), Arc::clone(&shutdown));
    let mut rpc = RpcTransport::new(config.transport.clone(), router, Arc::clone(&shutdown));
    let http_port = http.start().await.context("failed to bind HTTP listener")?;
    let rpc_port = rpc.start().await.context("failed to bind RPC listener")?;

    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.trigger_shutdown();
        });
    }

    shutdown.set_ready();
    info!(
        http_port,
        rpc_port,
        key_id = %config.key_id,
        cost = config.cost,
        rate_capacity = config.pipeline.hash.rate_limit.capacity,
        rate_interval = ?config.pipeline.hash.rate_limit.refill_interval,
        "vault ready"
    );

    let token = shutdown.shutdown_token();
    let http_stop = token.clone();
    let (http_result, rpc_result) = tokio::join!(
        http.serve(async move { http_stop.cancelled().await }),
        rpc.serve(async move { token.cancelled().await }),
    );
    http_result?;
    rpc_result?;

    if shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("all in-flight calls finished");
    } else {
        warn!(
            in_flight = shutdown.in_flight_count(),
            "drain timed out with calls still running"
        );
    }
    Ok(())
}
