//! Wire-level message schemas for the vault protocol.
//!
//! - [`base`]: the `Failure` body shared by all transports
//! - [`credential`]: canonical request/response pairs, one per method
//! - [`rpc`]: `MsgPack` envelopes for the binary transport

pub mod base;
pub mod credential;
pub mod rpc;

pub use base::{Failure, FailureKind};
pub use credential::{HashRequest, HashResponse, ValidateRequest, ValidateResponse};
pub use rpc::{CodecError, RpcCall, RpcReply, RpcRequest, RpcResponse};
