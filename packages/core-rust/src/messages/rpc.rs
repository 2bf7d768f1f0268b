//! Binary RPC envelopes.
//!
//! Each frame on the wire is one `MsgPack` map produced by
//! `rmp_serde::to_vec_named()`. Framing (length prefixes) is the transport's
//! job; this module only defines what goes inside a frame.
//!
//! The method discriminator is an internally-tagged `"method"` key so a frame
//! reads as `{"id": 7, "bearer": "...", "call": {"method": "Hash", "secret": "..."}}`.

use serde::{Deserialize, Serialize};

use super::base::Failure;
use super::credential::{HashRequest, HashResponse, ValidateRequest, ValidateResponse};

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

// ---------------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------------

/// The method-specific part of a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcCall {
    Hash(HashRequest),
    Validate(ValidateRequest),
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id chosen by the client, echoed in the response.
    pub id: u64,
    /// Bearer token for the authenticator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bearer: Option<String>,
    /// Remaining deadline budget of the caller, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,
    pub call: RpcCall,
}

impl RpcRequest {
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid request frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Response side
// ---------------------------------------------------------------------------

/// The method-specific part of a successful response frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RpcReply {
    Hash(HashResponse),
    Validate(ValidateResponse),
}

/// A response frame. Exactly one of `reply` or `error` is set.
///
/// `reply` may itself carry an in-band business failure; `error` is reserved
/// for rejections that happened before or instead of the business call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply: Option<RpcReply>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<Failure>,
}

impl RpcResponse {
    #[must_use]
    pub fn reply(id: u64, reply: RpcReply) -> Self {
        Self {
            id,
            reply: Some(reply),
            error: None,
        }
    }

    #[must_use]
    pub fn error(id: u64, failure: Failure) -> Self {
        Self {
            id,
            reply: None,
            error: Some(failure),
        }
    }

    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// # Errors
    ///
    /// Returns `CodecError::Decode` if the bytes are not a valid response frame.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
