//! Error types for the message model.

use thiserror::Error;

/// Result type for sip-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or interpreting message model values.
///
/// Every variant names the offending field so callers can surface an
/// `invalid` classification without touching any state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A URI could not be interpreted.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// A name-addr (From/To/Contact/Route) could not be interpreted.
    #[error("invalid name-addr: {0}")]
    InvalidNameAddr(String),

    /// A Via entry could not be interpreted.
    #[error("invalid Via: {0}")]
    InvalidVia(String),

    /// A CSeq value could not be interpreted.
    #[error("invalid CSeq: {0}")]
    InvalidCSeq(String),

    /// An unknown transport token was found.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// A required header is missing from a message.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
}
