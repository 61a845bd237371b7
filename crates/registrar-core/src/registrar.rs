//! REGISTER processing.
//!
//! Implements the registrar side of RFC 3261 §10 and RFC 5626: binding
//! maintenance, Path capture and synthesis, and outbound eligibility checks.
//! Authorization happens upstream in the route pipeline; by the time a
//! REGISTER reaches [`Registrar::process`] it is allowed to bind.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use sipflow_sip_core::{NameAddr, Param, Request, Response, StatusCode, Uri};
use sipflow_sip_transport::{encode_flow_token, instance_hash, ConnectionRegistry};

use crate::store::{contact_with_route, uri_unescape, Aor, Binding, BindingKey, RegistrarStore};
use crate::error::{Error, Result};

const DEFAULT_EXPIRES: u32 = 3600;

/// Reason phrase for a REGISTER carrying more than one `reg-id` contact.
pub const SEVERAL_REG_IDS: &str = "Several 'reg-id' Options";

/// The registrar: a binding store plus the connection registry used to mint
/// flow-token Paths.
pub struct Registrar {
    service: String,
    registry: Arc<ConnectionRegistry>,
    store: RegistrarStore,
    default_expires: u32,
}

impl Registrar {
    pub fn new(service: impl Into<String>, registry: Arc<ConnectionRegistry>) -> Self {
        Registrar {
            service: service.into(),
            registry,
            store: RegistrarStore::new(),
            default_expires: DEFAULT_EXPIRES,
        }
    }

    pub fn store(&self) -> &RegistrarStore {
        &self.store
    }

    /// Process a REGISTER, returning the response to send.
    pub fn process(&self, request: &Request) -> Response {
        match self.try_process(request) {
            Ok(response) => response,
            Err(Error::SeveralRegIds) => {
                Response::to_request(request, StatusCode::BAD_REQUEST).with_reason(SEVERAL_REG_IDS)
            }
            Err(Error::MalformedPath) => {
                Response::to_request(request, StatusCode::BAD_REQUEST)
            }
            Err(Error::FirstHopNotOutbound) => {
                Response::to_request(request, StatusCode::FIRST_HOP_LACKS_OUTBOUND)
            }
            Err(Error::AorNotFound(_)) => {
                Response::to_request(request, StatusCode::NOT_FOUND)
            }
        }
    }

    fn try_process(&self, request: &Request) -> Result<Response> {
        let aor = Aor::from_uri(&request.to.uri);

        let reg_id_contacts = request
            .contacts
            .iter()
            .filter(|c| c.has_param("reg-id") && self.contact_expires(c, request) > 0)
            .count();
        if reg_id_contacts > 1 {
            return Err(Error::SeveralRegIds);
        }

        let outbound_requested = request.supports("outbound") && reg_id_contacts == 1;
        let direct_client = request.vias.len() <= 1;

        // Path set replayed toward the UA, plus whether outbound applies.
        let (paths, outbound_active) = if direct_client {
            let path = self.direct_flow_path(request, outbound_requested);
            (path.into_iter().collect::<Vec<_>>(), outbound_requested)
        } else if outbound_requested {
            let paths = request.paths.clone();
            // The last Path element is the UA's first hop; outbound only
            // works if that hop recorded a flow.
            let first_hop = paths.last().ok_or(Error::FirstHopNotOutbound)?;
            if paths.iter().any(|p| !p.uri.is_lr()) {
                return Err(Error::MalformedPath);
            }
            if !(first_hop.uri.has_param("ob") || first_hop.has_param("ob")) {
                return Err(Error::FirstHopNotOutbound);
            }
            (paths, true)
        } else {
            (request.paths.clone(), false)
        };

        let now = Instant::now();
        for contact in &request.contacts {
            let expires = self.contact_expires(contact, request);
            let key = if outbound_active && contact.has_param("reg-id") {
                BindingKey::Outbound {
                    instance: instance_hash(&contact_instance(contact)),
                    reg_id: contact
                        .param("reg-id")
                        .flatten()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                }
            } else {
                BindingKey::for_contact(&contact.uri)
            };

            if expires == 0 {
                self.store.remove(&aor, &key);
                continue;
            }

            self.store.upsert(
                &aor,
                Binding {
                    key,
                    contact: contact.clone(),
                    path: paths.clone(),
                    source: request.binding,
                    expires_at: now + Duration::from_secs(u64::from(expires)),
                    call_id: request.call_id.clone(),
                    cseq: request.cseq.seq,
                },
            );
        }

        let mut response = Response::to_request(request, StatusCode::OK);
        response.contacts = self
            .store
            .lookup(&aor)
            .iter()
            .map(|b| {
                let secs = b.expires_at.saturating_duration_since(now).as_secs();
                b.contact
                    .clone()
                    .with_param(Param::new("expires", secs.to_string()))
            })
            .collect();
        response.paths = paths;
        response.supported = vec!["outbound".to_string(), "path".to_string()];
        if outbound_active {
            response.require = vec!["outbound".to_string()];
        }
        debug!(%aor, contacts = response.contacts.len(), outbound = outbound_active, "register processed");
        Ok(response)
    }

    /// Path for a direct (single-Via) client: the receiving connection
    /// encoded as a flow token. Minted whenever the client arrived on a
    /// stream connection worth reusing, or whenever outbound is requested.
    fn direct_flow_path(&self, request: &Request, outbound: bool) -> Option<NameAddr> {
        let binding = request.binding?;
        if !outbound && !binding.kind.is_reliable() {
            return None;
        }
        let flow = binding
            .flow
            .unwrap_or_else(|| self.registry.register(binding));
        let mut uri = Uri::new(binding.local.ip().to_string())
            .with_port(binding.local.port())
            .with_user(encode_flow_token(flow))
            .with_param(Param::flag("lr"));
        uri.set_param(Param::new("transport", binding.kind.as_str().to_ascii_lowercase()));
        if outbound {
            uri.set_param(Param::flag("ob"));
        }
        Some(NameAddr::new(uri))
    }

    fn contact_expires(&self, contact: &NameAddr, request: &Request) -> u32 {
        contact
            .param("expires")
            .flatten()
            .and_then(|v| v.parse().ok())
            .or(request.expires)
            .unwrap_or(self.default_expires)
    }

    /// All live contacts for an AOR, each carrying its path list as a
    /// URI-escaped `route` parameter.
    pub fn find(&self, aor_uri: &Uri) -> Result<Vec<NameAddr>> {
        let aor = Aor::from_uri(aor_uri);
        let bindings = self.store.lookup(&aor);
        if bindings.is_empty() {
            return Err(Error::AorNotFound(aor.to_string()));
        }
        Ok(bindings.iter().map(contact_with_route).collect())
    }

    /// Structured lookup for the proxy: (contact, path list) pairs.
    pub fn find_bindings(&self, aor_uri: &Uri) -> Result<Vec<Binding>> {
        let aor = Aor::from_uri(aor_uri);
        let bindings = self.store.lookup(&aor);
        if bindings.is_empty() {
            return Err(Error::AorNotFound(aor.to_string()));
        }
        Ok(bindings)
    }

    /// Drop expired bindings.
    pub fn sweep(&self) {
        self.store.sweep();
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// The `+sip.instance` value of a contact, unwrapped from quotes and
/// `<urn:...>` brackets; falls back to the contact URI itself so devices
/// without an instance id still get a stable key.
pub fn contact_instance(contact: &NameAddr) -> String {
    match contact.param("+sip.instance").flatten() {
        Some(v) => v.trim_matches('"').trim_matches(['<', '>']).to_string(),
        None => contact.uri.to_string(),
    }
}

/// Recover the route set folded into a `find` contact's `route` parameter.
pub fn routes_from_contact(contact: &NameAddr) -> Vec<NameAddr> {
    let Some(Some(routes)) = contact.uri.param("route") else {
        return Vec::new();
    };
    routes
        .split(',')
        .filter_map(uri_unescape_ref)
        .filter_map(|s| s.parse::<Uri>().ok())
        .map(NameAddr::new)
        .collect()
}

fn uri_unescape_ref(s: &str) -> Option<String> {
    let unescaped = uri_unescape(s)?;
    if unescaped.is_empty() {
        warn!("empty route element in contact");
        return None;
    }
    Some(unescaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::{Method, TransportBinding, TransportKind};

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new())
    }

    fn register_request(contact: NameAddr, supported: &[&str]) -> Request {
        let mut req = Request::new(
            Method::Register,
            Uri::new("registrar.example"),
            NameAddr::new(Uri::new("example.com").with_user("alice")).with_tag("ft"),
            NameAddr::new(Uri::new("example.com").with_user("alice")),
            "reg-call-1",
            1,
        );
        req.vias
            .push("SIP/2.0/TCP 10.0.0.1:5101;branch=z9hG4bKreg1".parse().unwrap());
        req.contacts.push(contact);
        req.supported = supported.iter().map(|s| s.to_string()).collect();
        req.expires = Some(300);
        req.binding = Some(TransportBinding::new(
            TransportKind::Tcp,
            "10.0.0.9:5060".parse().unwrap(),
            "10.0.0.1:5101".parse().unwrap(),
        ));
        req
    }

    #[test]
    fn plain_tcp_register_gets_flow_path() {
        let reg = Registrar::new("svc", registry());
        let contact = NameAddr::new(
            Uri::new("10.0.0.1")
                .with_user("ua1")
                .with_port(5101)
                .with_param(Param::new("transport", "tcp")),
        );
        let rsp = reg.process(&register_request(contact, &[]));
        assert_eq!(rsp.status, StatusCode::OK);
        assert!(rsp.require.is_empty());
        assert!(rsp.paths[0].uri.user.as_deref().unwrap().starts_with("NkF"));
        assert!(rsp.paths[0].uri.is_lr());
        assert!(!rsp.paths[0].uri.has_param("ob"));

        let aor: Uri = "sip:alice@example.com".parse().unwrap();
        let bindings = reg.find_bindings(&aor).unwrap();
        assert_eq!(bindings.len(), 1);
        assert!(matches!(
            bindings[0].key,
            BindingKey::Contact { transport: TransportKind::Tcp, port: 5101, .. }
        ));
    }

    #[test]
    fn several_reg_ids_rejected() {
        let reg = Registrar::new("svc", registry());
        let mut req = register_request(
            NameAddr::new(Uri::new("10.0.0.1").with_user("a").with_port(5101))
                .with_param(Param::new("reg-id", "1")),
            &["outbound", "path"],
        );
        req.contacts.push(
            NameAddr::new(Uri::new("10.0.0.1").with_user("a").with_port(5102))
                .with_param(Param::new("reg-id", "2")),
        );
        let rsp = reg.process(&req);
        assert_eq!(rsp.status, StatusCode::BAD_REQUEST);
        assert_eq!(rsp.reason_phrase(), SEVERAL_REG_IDS);
    }

    #[test]
    fn outbound_register_requires_outbound_and_keys_by_instance() {
        let reg = Registrar::new("svc", registry());
        let contact = NameAddr::new(Uri::new("10.0.0.1").with_user("ua1").with_port(5101))
            .with_param(Param::new("reg-id", "1"))
            .with_param(Param::new("+sip.instance", "\"<urn:uuid:abcd>\""));
        let rsp = reg.process(&register_request(contact, &["outbound", "path"]));
        assert_eq!(rsp.status, StatusCode::OK);
        assert_eq!(rsp.require, vec!["outbound"]);
        assert!(rsp.paths[0].uri.has_param("ob"));

        let aor: Uri = "sip:alice@example.com".parse().unwrap();
        let bindings = reg.find_bindings(&aor).unwrap();
        assert_eq!(
            bindings[0].key,
            BindingKey::Outbound {
                instance: instance_hash("urn:uuid:abcd"),
                reg_id: 1
            }
        );
    }

    #[test]
    fn multi_binding_per_instance_with_refresh_reorder() {
        let reg = Registrar::new("svc", registry());
        let mk = |instance: &str, reg_id: &str, port: u16| {
            NameAddr::new(Uri::new("10.0.0.1").with_user("ua").with_port(port))
                .with_param(Param::new("reg-id", reg_id))
                .with_param(Param::new("+sip.instance", format!("\"<{}>\"", instance)))
        };
        reg.process(&register_request(mk("i1", "1", 5101), &["outbound", "path"]));
        reg.process(&register_request(mk("i1", "2", 5102), &["outbound", "path"]));
        reg.process(&register_request(mk("i2", "1", 5103), &["outbound", "path"]));

        let aor: Uri = "sip:alice@example.com".parse().unwrap();
        assert_eq!(reg.find_bindings(&aor).unwrap().len(), 3);

        // Refreshing (i1, 2) replaces the old binding and moves it up front.
        reg.process(&register_request(mk("i1", "2", 5104), &["outbound", "path"]));
        let bindings = reg.find_bindings(&aor).unwrap();
        assert_eq!(bindings.len(), 3);
        assert_eq!(
            bindings[0].key,
            BindingKey::Outbound { instance: instance_hash("i1"), reg_id: 2 }
        );
        assert_eq!(bindings[0].contact.uri.port, Some(5104));
    }

    #[test]
    fn proxied_register_needs_ob_on_first_hop() {
        let reg = Registrar::new("svc", registry());
        let contact = NameAddr::new(Uri::new("10.0.0.1").with_user("ua1").with_port(5101))
            .with_param(Param::new("reg-id", "1"));
        let mut req = register_request(contact, &["outbound", "path"]);
        req.vias.insert(
            0,
            "SIP/2.0/UDP p2.example:5060;branch=z9hG4bKp2".parse().unwrap(),
        );
        // First hop path without `ob`: not outbound-capable.
        req.paths = vec![NameAddr::new(
            "sip:p2.example;lr".parse::<Uri>().unwrap(),
        )];
        let rsp = reg.process(&req);
        assert_eq!(rsp.status, StatusCode::FIRST_HOP_LACKS_OUTBOUND);

        // With `ob` on the first hop the registration succeeds.
        let contact = NameAddr::new(Uri::new("10.0.0.1").with_user("ua1").with_port(5101))
            .with_param(Param::new("reg-id", "1"));
        let mut req = register_request(contact, &["outbound", "path"]);
        req.vias.insert(
            0,
            "SIP/2.0/UDP p2.example:5060;branch=z9hG4bKp2b".parse().unwrap(),
        );
        req.paths = vec![
            NameAddr::new("sip:p3.example;lr".parse::<Uri>().unwrap()),
            NameAddr::new("sip:NkFtok@p1.example;lr;ob".parse::<Uri>().unwrap()),
        ];
        let rsp = reg.process(&req);
        assert_eq!(rsp.status, StatusCode::OK);
        assert_eq!(rsp.require, vec!["outbound"]);
    }

    #[test]
    fn find_folds_path_into_route_param() {
        let reg = Registrar::new("svc", registry());
        let contact = NameAddr::new(
            Uri::new("10.0.0.1")
                .with_user("ua1")
                .with_port(5101)
                .with_param(Param::new("transport", "tcp")),
        );
        reg.process(&register_request(contact, &[]));

        let aor: Uri = "sip:alice@example.com".parse().unwrap();
        let found = reg.find(&aor).unwrap();
        let routes = routes_from_contact(&found[0]);
        assert_eq!(routes.len(), 1);
        assert!(routes[0].uri.user.as_deref().unwrap().starts_with("NkF"));
        assert!(routes[0].uri.is_lr());
    }

    #[test]
    fn expires_zero_removes_binding() {
        let reg = Registrar::new("svc", registry());
        let contact = NameAddr::new(Uri::new("10.0.0.1").with_user("ua1").with_port(5101));
        reg.process(&register_request(contact.clone(), &[]));

        let mut req = register_request(contact, &[]);
        req.expires = Some(0);
        let rsp = reg.process(&req);
        assert_eq!(rsp.status, StatusCode::OK);
        assert!(rsp.contacts.is_empty());

        let aor: Uri = "sip:alice@example.com".parse().unwrap();
        assert!(reg.find(&aor).is_err());
    }
}
