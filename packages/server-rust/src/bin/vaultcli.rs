//! `vaultcli`: hashes or validates one secret against a running `vaultd`.
//!
//! `validate` exits 0 when the secret matches and 1 when it does not, so the
//! command composes in shell conditionals.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use vault_core::auth::DEFAULT_KEY_ID;
use vault_core::SigningKey;
use vault_server::service::methods;
use vault_server::telemetry::{init_tracing, LogFormat};
use vault_server::{CallContext, ClientConfig, CredentialService, VaultClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Http,
    Rpc,
}

#[derive(Debug, Parser)]
#[command(name = "vaultcli", version, about = "Credential vault client")]
struct Args {
    #[arg(long, value_enum, default_value_t = Transport::Http)]
    transport: Transport,

    /// Server address: `host:port`, or a full base URL for HTTP.
    #[arg(long, env = "VAULT_ADDR")]
    addr: Option<String>,

    /// HMAC secret shared with the server.
    #[arg(long, env = "VAULT_SIGNING_KEY", hide_env_values = true)]
    signing_key: String,

    #[arg(long, env = "VAULT_KEY_ID", default_value = DEFAULT_KEY_ID)]
    key_id: String,

    /// Log filter; logs go to stderr.
    #[arg(long, default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Derive a token from a secret and print it.
    Hash { secret: String },
    /// Check a secret against a token.
    Validate { secret: String, token: String },
}

impl Args {
    fn address(&self) -> String {
        match (&self.addr, self.transport) {
            (Some(addr), Transport::Http) if !addr.contains("://") => format!("http://{addr}"),
            (Some(addr), _) => addr.clone(),
            (None, Transport::Http) => "http://127.0.0.1:8080".to_string(),
            (None, Transport::Rpc) => "127.0.0.1:8081".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(LogFormat::Pretty, Some(&args.log))?;

    let key = Arc::new(SigningKey::new(args.key_id.clone(), &args.signing_key));
    let config = ClientConfig::default();
    let client = match args.transport {
        Transport::Http => VaultClient::http(args.address(), key, &config)?,
        Transport::Rpc => VaultClient::rpc(&args.address(), key, &config).await?,
    };

    match &args.command {
        Command::Hash { secret } => {
            let token = client.hash(&CallContext::new(methods::HASH), secret).await?;
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { secret, token } => {
            let valid = client
                .validate(&CallContext::new(methods::VALIDATE), secret, token)
                .await?;
            if valid {
                println!("valid: true");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("invalid: false");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
