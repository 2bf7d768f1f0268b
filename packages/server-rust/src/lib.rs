//! Vault server: credential service, tower pipeline, HTTP and RPC transports,
//! and the client facade that talks to them.

pub mod client;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use client::VaultClient;
pub use service::{
    CallContext, ClientConfig, CredentialService, OperationError, VaultConfig, VaultService,
};
pub use store::{MemoryStore, NullStore, SecretStore, StoreError};
pub use transport::{HttpTransport, RpcTransport, ShutdownController};
