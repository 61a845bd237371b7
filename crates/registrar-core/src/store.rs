//! Contact binding storage.

use std::fmt;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

use sipflow_sip_core::{NameAddr, Param, Scheme, TransportBinding, TransportKind, Uri};

/// Address-of-record: the public identity bindings attach to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aor {
    pub scheme: Scheme,
    pub user: String,
    pub host: String,
}

impl Aor {
    pub fn from_uri(uri: &Uri) -> Self {
        Aor {
            scheme: uri.scheme,
            user: uri.user.clone().unwrap_or_default().to_ascii_lowercase(),
            host: uri.host.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for Aor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.scheme, self.user, self.host)
    }
}

/// How a binding is keyed.
///
/// Pre-outbound contacts are identified by where they point; RFC 5626
/// bindings are identified by who registered them, so the same device
/// re-registering from a new connection replaces its old binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKey {
    Contact {
        scheme: Scheme,
        transport: TransportKind,
        user: String,
        host: String,
        port: u16,
    },
    Outbound {
        instance: u64,
        reg_id: u32,
    },
}

impl BindingKey {
    pub fn for_contact(uri: &Uri) -> Self {
        let (scheme, user, host, port) = uri.contact_index();
        BindingKey::Contact {
            scheme,
            transport: uri.transport().unwrap_or(TransportKind::Udp),
            user: user.unwrap_or_default(),
            host,
            port,
        }
    }
}

/// One registered contact.
#[derive(Debug, Clone)]
pub struct Binding {
    pub key: BindingKey,
    /// The contact as registered (without the synthetic `route` parameter).
    pub contact: NameAddr,
    /// Route set to replay through proxies back to the UA, nearest-to-UA last.
    pub path: Vec<NameAddr>,
    /// Snapshot of the connection the REGISTER arrived on.
    pub source: Option<TransportBinding>,
    pub expires_at: Instant,
    pub call_id: String,
    pub cseq: u32,
}

/// Registrar binding store. One writer (the registrar), concurrent readers.
#[derive(Default)]
pub struct RegistrarStore {
    bindings: DashMap<Aor, Vec<Binding>>,
}

impl RegistrarStore {
    pub fn new() -> Self {
        RegistrarStore::default()
    }

    /// Insert or refresh a binding. A binding with the same key replaces the
    /// old one and moves to the front: bindings are ordered most recently
    /// refreshed first.
    pub fn upsert(&self, aor: &Aor, binding: Binding) {
        let mut entry = self.bindings.entry(aor.clone()).or_default();
        entry.retain(|b| b.key != binding.key);
        entry.insert(0, binding);
        debug!(%aor, count = entry.len(), "binding refreshed");
    }

    /// Remove the binding with this key, if present.
    pub fn remove(&self, aor: &Aor, key: &BindingKey) {
        if let Some(mut entry) = self.bindings.get_mut(aor) {
            entry.retain(|b| b.key != *key);
            if entry.is_empty() {
                drop(entry);
                self.bindings.remove(aor);
            }
        }
    }

    /// Remove every binding for the AOR.
    pub fn clear(&self, aor: &Aor) {
        self.bindings.remove(aor);
    }

    /// Current live bindings, most recently refreshed first.
    pub fn lookup(&self, aor: &Aor) -> Vec<Binding> {
        let now = Instant::now();
        self.bindings
            .get(aor)
            .map(|e| e.iter().filter(|b| b.expires_at > now).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop expired bindings everywhere.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.bindings.retain(|_, entry| {
            entry.retain(|b| b.expires_at > now);
            !entry.is_empty()
        });
    }
}

/// Render a binding's contact for a `find` result: the contact URI with the
/// path list folded into a URI-escaped `route` parameter.
pub fn contact_with_route(binding: &Binding) -> NameAddr {
    let mut contact = binding.contact.clone();
    if !binding.path.is_empty() {
        let routes = binding
            .path
            .iter()
            .map(|p| uri_escape(&p.uri.to_string()))
            .collect::<Vec<_>>()
            .join(",");
        contact.uri.set_param(Param::new("route", routes));
    }
    contact
}

/// Minimal percent-escaping for URI parameter values.
pub fn uri_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Inverse of [`uri_escape`].
pub fn uri_unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let v = u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?;
            out.push(v);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn aor() -> Aor {
        Aor {
            scheme: Scheme::Sip,
            user: "alice".into(),
            host: "example.com".into(),
        }
    }

    fn binding(key: BindingKey, tag: &str) -> Binding {
        Binding {
            key,
            contact: NameAddr::new(Uri::new("1.2.3.4").with_user(tag)),
            path: Vec::new(),
            source: None,
            expires_at: Instant::now() + Duration::from_secs(60),
            call_id: "c".into(),
            cseq: 1,
        }
    }

    #[test]
    fn refresh_replaces_and_moves_to_front() {
        let store = RegistrarStore::new();
        let k1 = BindingKey::Outbound { instance: 1, reg_id: 1 };
        let k2 = BindingKey::Outbound { instance: 1, reg_id: 2 };
        store.upsert(&aor(), binding(k1.clone(), "a"));
        store.upsert(&aor(), binding(k2.clone(), "b"));
        store.upsert(&aor(), binding(k1.clone(), "a2"));

        let got = store.lookup(&aor());
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].key, k1);
        assert_eq!(got[0].contact.uri.user.as_deref(), Some("a2"));
        assert_eq!(got[1].key, k2);
    }

    #[test]
    fn expired_bindings_are_invisible_and_swept() {
        let store = RegistrarStore::new();
        let k = BindingKey::Outbound { instance: 1, reg_id: 1 };
        let mut b = binding(k, "a");
        b.expires_at = Instant::now() - Duration::from_secs(1);
        store.upsert(&aor(), b);
        assert!(store.lookup(&aor()).is_empty());
        store.sweep();
    }

    #[test]
    fn escape_round_trip() {
        let s = "sip:NkFAbc@10.0.0.1:5080;lr;ob";
        assert_eq!(uri_unescape(&uri_escape(s)).unwrap(), s);
    }
}
