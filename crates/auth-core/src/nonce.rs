//! Time-bounded nonce table.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;

/// Key: (service, call-id, nonce).
type NonceKey = (String, String, String);

struct NonceEntry {
    ip: IpAddr,
    expires_at: Instant,
}

/// Issued nonces with the requester address that saw the challenge.
///
/// One store is shared by every call actor of a stack instance; entries
/// expire after the service's `nonce_timeout`.
#[derive(Default)]
pub struct NonceStore {
    entries: DashMap<NonceKey, NonceEntry>,
}

impl NonceStore {
    pub fn new() -> Self {
        NonceStore::default()
    }

    /// Record a freshly issued nonce.
    pub fn insert(&self, service: &str, call_id: &str, nonce: &str, ip: IpAddr, ttl: Duration) {
        self.entries.insert(
            (service.to_string(), call_id.to_string(), nonce.to_string()),
            NonceEntry {
                ip,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// The address the nonce was issued to, if the nonce is still valid for
    /// this call.
    pub fn get(&self, service: &str, call_id: &str, nonce: &str) -> Option<IpAddr> {
        let key = (service.to_string(), call_id.to_string(), nonce.to_string());
        let entry = self.entries.get(&key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.ip)
    }

    /// Drop expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A fresh random nonce.
pub fn make_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
