//! Transport identity attached to messages.
//!
//! The message model does not own any sockets; it only records *which*
//! connection a message arrived on or must leave through. The live connection
//! pool itself lives in the transport crate and is addressed through
//! [`FlowId`] handles, so a binding stays a plain value even after the
//! underlying connection has died.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The transport protocol a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl TransportKind {
    /// Whether the transport provides its own delivery guarantees.
    ///
    /// Retransmission timers (A/E/G) only run over unreliable transports.
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// The token used in Via headers and `;transport=` URI parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            "WS" | "WSS" => Ok(TransportKind::Ws),
            other => Err(Error::UnknownTransport(other.to_string())),
        }
    }
}

/// Handle to a registered connection: a slot index plus a generation counter.
///
/// The epoch makes a reused slot distinguishable from the connection that
/// previously occupied it, so a stale flow token can never validate against a
/// newer connection in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId {
    pub slot: u32,
    pub epoch: u32,
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.epoch)
    }
}

/// The connection a message was received on or must be sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportBinding {
    /// Transport protocol of the connection.
    pub kind: TransportKind,
    /// Local listen address.
    pub local: SocketAddr,
    /// Remote peer address.
    pub remote: SocketAddr,
    /// Pool handle when the connection is registered (stream transports).
    pub flow: Option<FlowId>,
}

impl TransportBinding {
    pub fn new(kind: TransportKind, local: SocketAddr, remote: SocketAddr) -> Self {
        TransportBinding {
            kind,
            local,
            remote,
            flow: None,
        }
    }

    pub fn with_flow(mut self, flow: FlowId) -> Self {
        self.flow = Some(flow);
        self
    }

    /// The (transport, ip, port) origin triple used for CANCEL matching and
    /// dialog origin authorization.
    pub fn origin(&self) -> (TransportKind, std::net::IpAddr, u16) {
        (self.kind, self.remote.ip(), self.remote.port())
    }
}

impl fmt::Display for TransportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<->{}", self.kind, self.local, self.remote)
    }
}
