//! Authentication errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers so they can retry with credentials.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The Authorization/Proxy-Authorization header could not be used:
    /// malformed, wrong scheme, or an unsupported qop/algorithm.
    #[error("invalid auth header: {0}")]
    InvalidAuthHeader(String),

    /// The nonce is not in the table and the opaque does not match either.
    #[error("unknown nonce")]
    UnknownNonce,

    /// The password callback had no credentials for the user.
    #[error("no password for user")]
    NoPassword,
}
