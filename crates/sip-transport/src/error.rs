//! Transport layer errors.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the transport seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The connection a flow token references has died. Propagates to a
    /// 430 response at the proxy/registrar boundary.
    #[error("flow failed")]
    FlowFailed,

    /// A flow token that could not be decoded. Propagates to 403.
    #[error("invalid flow token")]
    InvalidFlowToken,

    /// Sending on a connection that was closed under us.
    #[error("connection closed")]
    ConnectionClosed,

    /// No listener at the destination of a stream transport.
    #[error("destination unreachable: {0}")]
    Unreachable(SocketAddr),

    /// A URI that cannot be resolved to a destination address.
    #[error("cannot resolve destination: {0}")]
    ResolveFailed(String),

    /// Errors from the message model.
    #[error(transparent)]
    Core(#[from] sipflow_sip_core::Error),
}
