//! Vault core: credential primitive, bearer-token codec and wire message schemas.

pub mod auth;
pub mod messages;
pub mod primitive;

pub use auth::{AuthError, Claims, SigningKey, VerifiedClaims};
pub use messages::{
    Failure, FailureKind, HashRequest, HashResponse, ValidateRequest, ValidateResponse,
};
pub use primitive::{BcryptPrimitive, CredentialPrimitive, PrimitiveError};
