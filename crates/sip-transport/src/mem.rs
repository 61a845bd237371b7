//! In-memory transport for tests and examples.
//!
//! A [`MemHub`] plays the role of the network: endpoints attach at a socket
//! address and exchange already-parsed messages. Stream kinds get per-link
//! connection entries in each endpoint's [`ConnectionRegistry`], so flow
//! tokens behave exactly as they would over real TCP: killing a link makes
//! every token that references it fail.
//!
//! Datagram sends to an address nobody listens on are dropped silently, the
//! way the real network loses packets; that is what the timer tests rely on.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use sipflow_sip_core::{FlowId, SipMessage, TransportBinding, TransportKind};

use crate::error::{Error, Result};
use crate::registry::ConnectionRegistry;
use crate::transport::Transport;

const CHANNEL_CAPACITY: usize = 64;

/// One delivered frame, kept for test assertions.
#[derive(Debug, Clone)]
pub struct Frame {
    pub from: SocketAddr,
    pub to: SocketAddr,
    /// Receiver-side flow the frame arrived on, for stream kinds.
    pub flow: Option<FlowId>,
    pub message: SipMessage,
}

struct Endpoint {
    kind: TransportKind,
    tx: mpsc::Sender<SipMessage>,
    registry: Arc<ConnectionRegistry>,
}

/// Undirected link key.
fn link_key(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if (a.ip(), a.port()) <= (b.ip(), b.port()) {
        (a, b)
    } else {
        (b, a)
    }
}

struct Link {
    alive: bool,
    /// Flow registered at each side's registry, keyed by that side's address.
    flows: [(SocketAddr, FlowId); 2],
}

impl Link {
    fn flow_at(&self, side: SocketAddr) -> Option<FlowId> {
        self.flows.iter().find(|(addr, _)| *addr == side).map(|(_, f)| *f)
    }
}

#[derive(Default)]
struct HubInner {
    endpoints: DashMap<SocketAddr, Endpoint>,
    links: DashMap<(SocketAddr, SocketAddr), Link>,
    trace: Mutex<Vec<Frame>>,
}

/// The in-memory network.
#[derive(Clone, Default)]
pub struct MemHub {
    inner: Arc<HubInner>,
}

impl MemHub {
    pub fn new() -> Self {
        MemHub::default()
    }

    /// Attach an endpoint. Messages delivered to `addr` come out of the
    /// returned receiver, already carrying their receive binding.
    pub fn endpoint(
        &self,
        kind: TransportKind,
        addr: SocketAddr,
    ) -> (Arc<MemTransport>, mpsc::Receiver<SipMessage>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let registry = Arc::new(ConnectionRegistry::new());
        self.inner.endpoints.insert(
            addr,
            Endpoint {
                kind,
                tx,
                registry: registry.clone(),
            },
        );
        let transport = Arc::new(MemTransport {
            kind,
            local: addr,
            registry,
            hub: self.inner.clone(),
        });
        (transport, rx)
    }

    /// Tear down the link between two endpoints, killing its flows on both
    /// sides. Subsequent pinned sends fail with `FlowFailed`.
    pub fn close_link(&self, a: SocketAddr, b: SocketAddr) {
        if let Some(mut link) = self.inner.links.get_mut(&link_key(a, b)) {
            link.alive = false;
            for (side, flow) in link.flows {
                if let Some(ep) = self.inner.endpoints.get(&side) {
                    ep.registry.close(flow);
                }
            }
            debug!(%a, %b, "closed link");
        }
    }

    /// Everything delivered so far.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner.trace.lock().clone()
    }

    /// Delivered requests addressed to `to`, most recent last.
    pub fn frames_to(&self, to: SocketAddr) -> Vec<Frame> {
        self.frames().into_iter().filter(|f| f.to == to).collect()
    }
}

/// An endpoint attached to a [`MemHub`].
pub struct MemTransport {
    kind: TransportKind,
    local: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    hub: Arc<HubInner>,
}

impl MemTransport {
    /// Get or create the link to `remote`, returning the flow ids for the
    /// (sender, receiver) sides. A dead link is replaced by a fresh one with
    /// new epochs, like a TCP reconnect.
    fn link_flows(&self, remote: SocketAddr) -> Result<(FlowId, FlowId)> {
        let key = link_key(self.local, remote);
        if let Some(link) = self.hub.links.get(&key) {
            if link.alive {
                let near = link.flow_at(self.local).ok_or(Error::ConnectionClosed)?;
                let far = link.flow_at(remote).ok_or(Error::ConnectionClosed)?;
                return Ok((near, far));
            }
        }
        let far_ep = self
            .hub
            .endpoints
            .get(&remote)
            .ok_or(Error::Unreachable(remote))?;
        let near = self
            .registry
            .register(TransportBinding::new(self.kind, self.local, remote));
        let far = far_ep
            .registry
            .register(TransportBinding::new(self.kind, remote, self.local));
        self.hub.links.insert(
            key,
            Link {
                alive: true,
                flows: [(self.local, near), (remote, far)],
            },
        );
        Ok((near, far))
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn send(&self, msg: SipMessage, dest: TransportBinding) -> Result<()> {
        // A pinned send must ride the exact connection the flow names.
        let remote = match dest.flow {
            Some(flow) => self.registry.lookup(flow)?.remote,
            None => dest.remote,
        };

        let receiver_flow = if self.kind.is_reliable() {
            if dest.flow.is_some() {
                // The link itself must still be up.
                let key = link_key(self.local, remote);
                match self.hub.links.get(&key) {
                    Some(link) if link.alive => link.flow_at(remote),
                    _ => return Err(Error::FlowFailed),
                }
            } else {
                Some(self.link_flows(remote)?.1)
            }
        } else {
            None
        };

        // Copy what we need out of the map entry; the guard must not be
        // held across the channel send below.
        let endpoint = self
            .hub
            .endpoints
            .get(&remote)
            .map(|e| (e.kind, e.tx.clone()));
        let Some((remote_kind, remote_tx)) = endpoint else {
            if self.kind.is_reliable() {
                return Err(Error::Unreachable(remote));
            }
            trace!(%remote, "dropping datagram to unreachable address");
            return Ok(());
        };

        let mut binding = TransportBinding::new(remote_kind, remote, self.local);
        binding.flow = receiver_flow;

        let mut delivered = msg;
        match &mut delivered {
            SipMessage::Request(r) => r.binding = Some(binding),
            SipMessage::Response(r) => r.binding = Some(binding),
        }

        self.hub.trace.lock().push(Frame {
            from: self.local,
            to: remote,
            flow: receiver_flow,
            message: delivered.clone(),
        });

        remote_tx
            .send(delivered)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemTransport({}/{})", self.kind, self.local)
    }
}
