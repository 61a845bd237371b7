//! Registrar errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// More than one contact in a single REGISTER carries `reg-id`.
    #[error("several 'reg-id' options")]
    SeveralRegIds,

    /// The Path set does not satisfy RFC 5626 (no loose routing).
    #[error("malformed path set")]
    MalformedPath,

    /// Outbound registration whose first hop did not record a flow.
    #[error("first hop lacks outbound support")]
    FirstHopNotOutbound,

    /// The AOR has no bindings.
    #[error("address-of-record not found: {0}")]
    AorNotFound(String),
}
