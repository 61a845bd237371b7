//! Shared harness for the scenario tests: stacks wired to an in-memory hub.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use sipflow_call_core::{ServiceConfig, ServiceHandler, SipStack};
use sipflow_sip_core::{Method, NameAddr, Param, Request, TransportKind, Uri};
use sipflow_sip_transport::{MemHub, MemTransport};

/// One stack attached to the hub.
pub struct Node {
    pub stack: SipStack,
    pub transport: Arc<MemTransport>,
    pub addr: SocketAddr,
}

/// Install the test subscriber once so failures come with traces
/// (`RUST_LOG=sipflow_call_core=debug` and friends).
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn node(
    hub: &MemHub,
    kind: TransportKind,
    addr: &str,
    config: ServiceConfig,
    handler: Arc<dyn ServiceHandler>,
) -> Node {
    init_tracing();
    let addr: SocketAddr = addr.parse().unwrap();
    let (transport, rx) = hub.endpoint(kind, addr);
    let stack = SipStack::new(config, handler, transport.clone());
    stack.spawn_receiver(rx);
    Node {
        stack,
        transport,
        addr,
    }
}

/// A loose route pointing at a node.
pub fn route_to(addr: SocketAddr, kind: TransportKind) -> NameAddr {
    let mut uri = Uri::new(addr.ip().to_string())
        .with_port(addr.port())
        .with_param(Param::flag("lr"));
    if kind != TransportKind::Udp {
        uri.set_param(Param::new("transport", kind.as_str().to_ascii_lowercase()));
    }
    NameAddr::new(uri)
}

/// A request between two users, RURI pointing at `target`.
pub fn request(method: Method, from_user: &str, to_user: &str, target: Uri) -> Request {
    Request::new(
        method,
        target,
        NameAddr::new(Uri::new("example.com").with_user(from_user)),
        NameAddr::new(Uri::new("example.com").with_user(to_user)),
        "",
        0,
    )
}

/// A request addressed to an AOR, routed through `via`.
pub fn routed_request(
    method: Method,
    from_user: &str,
    to_user: &str,
    via: SocketAddr,
    kind: TransportKind,
) -> Request {
    let mut req = request(
        method,
        from_user,
        to_user,
        Uri::new("example.com").with_user(to_user),
    );
    req.routes.push(route_to(via, kind));
    req
}

/// Config with test-friendly timers.
pub fn config(name: &str) -> ServiceConfig {
    ServiceConfig::new(name)
}
