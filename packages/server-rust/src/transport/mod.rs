//! Network surfaces of the vault: HTTP JSON and length-delimited binary RPC.
//!
//! Both transports decode into the same [`Operation`](crate::service::Operation)
//! and dispatch through one [`OperationRouter`](crate::service::OperationRouter),
//! so rate limiting, circuit breaking and authentication behave identically
//! whichever way a request arrives.

pub mod http;
pub mod rpc;
pub mod shutdown;

pub use self::http::HttpTransport;
pub use self::rpc::{frame_codec, RpcTransport};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
