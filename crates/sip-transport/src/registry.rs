//! Connection registry and flow tokens.
//!
//! RFC 5626 needs a way to refer to a specific live connection from inside a
//! URI. The registry hands out [`FlowId`] handles — a slot index plus an
//! epoch — and the token codec embeds them in the user part of a
//! Record-Route or Path URI. The epoch guards against slot reuse: a token
//! minted for a closed connection can never validate against whatever later
//! occupies its slot.
//!
//! Token format on the wire: the URI user starts with `NkF` followed by a
//! URL-safe base64 encoding of the slot and epoch. The `NkQ` variant is not
//! a flow reference at all; it is a branch-derived marker used when no flow
//! must be pinned.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use sipflow_sip_core::{FlowId, TransportBinding};

use crate::error::{Error, Result};

/// URI-user prefix marking a route as a flow reference.
pub const FLOW_TOKEN_PREFIX: &str = "NkF";

/// URI-user prefix of the branch-derived (non-flow) marker.
pub const BRANCH_TOKEN_PREFIX: &str = "NkQ";

struct Slot {
    epoch: u32,
    binding: TransportBinding,
    alive: bool,
}

/// Registry of live stream connections, keyed by slot.
///
/// One registry exists per stack instance; flow tokens minted here are only
/// meaningful to the instance that minted them.
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: DashMap<u32, Slot>,
    next_slot: AtomicU32,
    next_epoch: AtomicU32,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Register a connection and return its handle. The returned id is also
    /// written into the binding stored in the registry.
    pub fn register(&self, binding: TransportBinding) -> FlowId {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let flow = FlowId { slot, epoch };
        self.slots.insert(
            slot,
            Slot {
                epoch,
                binding: binding.with_flow(flow),
                alive: true,
            },
        );
        debug!(flow = %flow, binding = %binding, "registered connection");
        flow
    }

    /// The binding behind a handle, or `FlowFailed` when the connection has
    /// died or the slot was reused.
    pub fn lookup(&self, flow: FlowId) -> Result<TransportBinding> {
        match self.slots.get(&flow.slot) {
            Some(slot) if slot.epoch == flow.epoch && slot.alive => Ok(slot.binding),
            _ => Err(Error::FlowFailed),
        }
    }

    /// Whether the handle still refers to a live connection.
    pub fn is_alive(&self, flow: FlowId) -> bool {
        self.lookup(flow).is_ok()
    }

    /// Mark a connection dead. Idempotent; the slot is retained so stale
    /// tokens keep failing rather than turning into unknown slots.
    pub fn close(&self, flow: FlowId) {
        if let Some(mut slot) = self.slots.get_mut(&flow.slot) {
            if slot.epoch == flow.epoch && slot.alive {
                slot.alive = false;
                debug!(flow = %flow, "closed connection");
            }
        }
    }

    /// Close every registered connection to/from the given peer address.
    /// Test harnesses use this to simulate a dropped TCP link.
    pub fn close_peer(&self, peer: std::net::SocketAddr) {
        for mut slot in self.slots.iter_mut() {
            if slot.binding.remote == peer && slot.alive {
                slot.alive = false;
            }
        }
    }

    /// Find the live handle for an exact (local, remote) pair, if any.
    pub fn find(&self, local: std::net::SocketAddr, remote: std::net::SocketAddr) -> Option<FlowId> {
        self.slots.iter().find_map(|slot| {
            (slot.alive && slot.binding.local == local && slot.binding.remote == remote)
                .then_some(FlowId {
                    slot: *slot.key(),
                    epoch: slot.epoch,
                })
        })
    }
}

/// Encode a handle as a flow-token URI user: `NkF` + base64(slot, epoch).
pub fn encode_flow_token(flow: FlowId) -> String {
    let mut raw = [0u8; 8];
    raw[..4].copy_from_slice(&flow.slot.to_be_bytes());
    raw[4..].copy_from_slice(&flow.epoch.to_be_bytes());
    format!("{}{}", FLOW_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(raw))
}

/// Decode a flow-token URI user produced by [`encode_flow_token`].
///
/// Returns `InvalidFlowToken` for anything that is not syntactically a
/// token; liveness is the registry's business, not the codec's.
pub fn decode_flow_token(user: &str) -> Result<FlowId> {
    let encoded = user
        .strip_prefix(FLOW_TOKEN_PREFIX)
        .ok_or(Error::InvalidFlowToken)?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| Error::InvalidFlowToken)?;
    if raw.len() != 8 {
        return Err(Error::InvalidFlowToken);
    }
    let slot = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let epoch = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Ok(FlowId { slot, epoch })
}

/// Whether a URI user part looks like a flow token.
pub fn is_flow_token(user: &str) -> bool {
    user.starts_with(FLOW_TOKEN_PREFIX)
}

/// The `NkQ` branch-derived marker: a stable hash over the global instance
/// id, the service name and the transaction branch.
pub fn branch_token(global_id: &str, service: &str, branch: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(global_id.as_bytes());
    hasher.update(b":");
    hasher.update(service.as_bytes());
    hasher.update(b":");
    hasher.update(branch.as_bytes());
    let digest = hasher.finalize();
    format!("{}{}", BRANCH_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(&digest[..12]))
}

/// Hash of an instance id, used in outbound registrar binding keys.
pub fn instance_hash(instance: &str) -> u64 {
    let digest = Sha256::digest(instance.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::TransportKind;

    fn binding() -> TransportBinding {
        TransportBinding::new(
            TransportKind::Tcp,
            "127.0.0.1:5060".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[test]
    fn token_round_trips_while_alive() {
        let reg = ConnectionRegistry::new();
        let flow = reg.register(binding());
        let token = encode_flow_token(flow);
        assert!(token.starts_with("NkF"));
        let decoded = decode_flow_token(&token).unwrap();
        assert_eq!(decoded, flow);
        assert!(reg.lookup(decoded).is_ok());
    }

    #[test]
    fn closed_connection_fails_flow() {
        let reg = ConnectionRegistry::new();
        let flow = reg.register(binding());
        reg.close(flow);
        assert_eq!(reg.lookup(flow), Err(Error::FlowFailed));
        // Closing twice is fine.
        reg.close(flow);
    }

    #[test]
    fn stale_epoch_never_validates() {
        let reg = ConnectionRegistry::new();
        let flow = reg.register(binding());
        let stale = FlowId {
            slot: flow.slot,
            epoch: flow.epoch.wrapping_add(1),
        };
        assert_eq!(reg.lookup(stale), Err(Error::FlowFailed));
    }

    #[test]
    fn garbage_tokens_are_invalid_not_failed() {
        assert_eq!(decode_flow_token("NkFnot-base64!!"), Err(Error::InvalidFlowToken));
        assert_eq!(decode_flow_token("NkQabc"), Err(Error::InvalidFlowToken));
        assert_eq!(decode_flow_token("plainuser"), Err(Error::InvalidFlowToken));
    }

    #[test]
    fn branch_tokens_are_stable_and_distinct() {
        let a = branch_token("g", "svc", "z9hG4bK1");
        let b = branch_token("g", "svc", "z9hG4bK1");
        let c = branch_token("g", "svc", "z9hG4bK2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("NkQ"));
    }
}
