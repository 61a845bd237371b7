//! The transport seam.
//!
//! Real UDP/TCP/TLS transports live outside this repository; the stack only
//! depends on this trait. A transport parses inbound frames into
//! [`SipMessage`] values (attaching the receiving [`TransportBinding`])
//! before delivery, and serialises outbound messages after [`Transport::send`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use sipflow_sip_core::{Scheme, SipMessage, TransportBinding, TransportKind, Uri};

use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;

/// A SIP transport endpoint.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Transport protocol of this endpoint.
    fn kind(&self) -> TransportKind;

    /// Local listen address.
    fn local_addr(&self) -> SocketAddr;

    /// The registry of live connections owned by this endpoint.
    fn registry(&self) -> &Arc<ConnectionRegistry>;

    /// Serialise and send a message to `dest`.
    ///
    /// When `dest.flow` is set the message is pinned to that connection:
    /// the send fails with [`Error::FlowFailed`] rather than opening a new
    /// connection if it has died.
    async fn send(&self, msg: SipMessage, dest: TransportBinding) -> Result<()>;

    /// Whether the transport provides its own delivery guarantees.
    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }
}

/// Resolve a URI to a concrete destination.
///
/// DNS/NAPTR/SRV resolution is an external collaborator; this helper only
/// handles what the core needs on its own: IP literals and `localhost`, the
/// `;transport=` parameter, and scheme-default ports.
pub fn resolve_uri(uri: &Uri) -> Result<(TransportKind, SocketAddr)> {
    let kind = uri.transport().unwrap_or(match uri.scheme {
        Scheme::Sip => TransportKind::Udp,
        Scheme::Sips => TransportKind::Tls,
    });
    let ip: IpAddr = if uri.host.eq_ignore_ascii_case("localhost") {
        IpAddr::from([127, 0, 0, 1])
    } else {
        uri.host
            .parse()
            .map_err(|_| Error::ResolveFailed(uri.to_string()))?
    };
    let port = uri.port.unwrap_or(match uri.scheme {
        Scheme::Sip => 5060,
        Scheme::Sips => 5061,
    });
    Ok((kind, SocketAddr::new(ip, port)))
}
