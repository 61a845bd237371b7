//! RFC 5626 outbound support: flow-token routes, Path/Record-Route
//! synthesis and `ob` contact decoration.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use sipflow_sip_core::{
    FlowId, Method, NameAddr, Param, Request, TransportBinding, TransportKind, Uri,
};
use sipflow_sip_transport::{
    branch_token, decode_flow_token, encode_flow_token, is_flow_token, ConnectionRegistry,
    Error as TransportError,
};

use crate::config::ServiceConfig;

/// What inspecting a request's Route set decided.
#[derive(Debug, Default)]
pub struct RouteDisposition {
    /// Send the request over this connection instead of resolving the RURI.
    pub forced_dest: Option<TransportBinding>,
    /// Flow to embed when synthesising Record-Route/Path, with its `ob`
    /// annotation.
    pub record_flow: Option<(FlowId, bool)>,
}

/// Strip the routes addressed to this proxy off the top of the request and
/// interpret any flow semantics they carry (RFC 5626 §5.3).
///
/// A flow-token route either confirms the connection the request arrived on
/// (record only) or forces the outgoing transport onto the decoded flow. A
/// token whose connection has died is `FlowFailed` (→ 430); a token that
/// does not decode is `InvalidFlowToken` (→ 403).
pub fn strip_own_routes(
    config: &ServiceConfig,
    registry: &Arc<ConnectionRegistry>,
    local: SocketAddr,
    request: &mut Request,
) -> Result<RouteDisposition, TransportError> {
    let mut disposition = RouteDisposition::default();
    let outbound_aware = request.supports("outbound") || config.supports("outbound");

    while let Some(top) = request.routes.first() {
        if !route_is_local(&top.uri, local) {
            break;
        }
        let route = request.routes.remove(0);
        let route_ob = route.uri.has_param("ob") || route.has_param("ob");

        let Some(user) = route.uri.user.as_deref() else {
            continue;
        };

        if is_flow_token(user) {
            let flow = decode_flow_token(user)?;
            let binding = registry.lookup(flow)?;
            let arrived_on = request.binding.and_then(|b| b.flow);
            if arrived_on == Some(flow) {
                // Same connection the request came in on: just record it.
                disposition.record_flow = Some((flow, route_ob));
            } else {
                // Route the request out over the referenced flow.
                disposition.forced_dest = Some(binding);
                let contact_ob = request
                    .contact()
                    .is_some_and(|c| c.uri.has_param("ob") || c.has_param("ob"));
                if route_ob || contact_ob {
                    if let Some(incoming) = incoming_flow(registry, request) {
                        disposition.record_flow = Some((incoming, route_ob));
                    }
                }
            }
            debug!(flow = %flow, forced = disposition.forced_dest.is_some(), "flow route consumed");
        } else if route_ob && outbound_aware {
            // A plain `ob` route asks us to record the incoming connection.
            if let Some(incoming) = incoming_flow(registry, request) {
                disposition.record_flow = Some((incoming, true));
            }
        }
    }

    Ok(disposition)
}

/// The flow of the connection the request arrived on, minting a registry
/// entry for datagram sources on demand.
fn incoming_flow(registry: &Arc<ConnectionRegistry>, request: &Request) -> Option<FlowId> {
    let binding = request.binding?;
    match binding.flow {
        Some(flow) => Some(flow),
        None => registry
            .find(binding.local, binding.remote)
            .or_else(|| Some(registry.register(binding))),
    }
}

/// Whether a route URI addresses this listener.
fn route_is_local(uri: &Uri, local: SocketAddr) -> bool {
    let port = uri.port.unwrap_or(5060);
    if port != local.port() {
        return false;
    }
    uri.host
        .parse::<std::net::IpAddr>()
        .map(|ip| ip == local.ip())
        .unwrap_or(false)
}

/// REGISTER path recording at a proxy (RFC 5626 §5.1): with the `path`
/// option, a UA supporting path+outbound and exactly one `reg-id` contact,
/// the receiving connection becomes a flow. The first hop (single Via before
/// ours goes on) is annotated `ob`.
pub fn register_path_flow(
    registry: &Arc<ConnectionRegistry>,
    request: &Request,
) -> Option<(FlowId, bool)> {
    if request.method != Method::Register {
        return None;
    }
    if !(request.supports("path") && request.supports("outbound")) {
        return None;
    }
    let reg_id_contacts = request
        .contacts
        .iter()
        .filter(|c| c.has_param("reg-id"))
        .count();
    if reg_id_contacts != 1 {
        return None;
    }
    let flow = incoming_flow(registry, request)?;
    let first_hop = request.vias.len() <= 1;
    Some((flow, first_hop))
}

/// A Record-Route or Path URI for this proxy: flow-token user when a flow is
/// recorded, branch-derived `NkQ` user otherwise. `lr` always; `ob` when the
/// flow was annotated.
pub fn proxy_route_uri(
    config: &ServiceConfig,
    local: SocketAddr,
    kind: TransportKind,
    record_flow: Option<(FlowId, bool)>,
    branch: &str,
) -> NameAddr {
    let (user, ob) = match record_flow {
        Some((flow, ob)) => (encode_flow_token(flow), ob),
        None => (branch_token(&config.global_id, &config.name, branch), false),
    };
    let mut uri = Uri::new(local.ip().to_string())
        .with_port(local.port())
        .with_user(user)
        .with_param(Param::flag("lr"));
    if kind != TransportKind::Udp {
        uri.set_param(Param::new("transport", kind.as_str().to_ascii_lowercase()));
    }
    if ob {
        uri.set_param(Param::flag("ob"));
    }
    NameAddr::new(uri)
}

/// Build the Contact for a locally originated request.
///
/// Dialog-forming requests get `ob` when the service supports outbound;
/// REGISTER gets `reg-id` when configured; a contact built from scratch
/// always carries `+sip.instance`.
pub fn local_contact(
    config: &ServiceConfig,
    request: &Request,
    local: SocketAddr,
    kind: TransportKind,
    reg_id: Option<u32>,
) -> NameAddr {
    let user = request
        .from
        .uri
        .user
        .clone()
        .unwrap_or_else(|| config.from_user.clone());
    let mut uri = Uri::new(local.ip().to_string())
        .with_port(local.port())
        .with_user(user);
    if kind != TransportKind::Udp {
        uri.set_param(Param::new("transport", kind.as_str().to_ascii_lowercase()));
    }
    if request.is_dialog_forming() && request.supports("outbound") {
        uri.set_param(Param::flag("ob"));
    }

    let mut contact = NameAddr::new(uri);
    contact.set_param(Param::new(
        "+sip.instance",
        format!("\"<{}>\"", config.instance_id),
    ));
    if request.method == Method::Register {
        if let Some(reg_id) = reg_id.or(config.reg_id) {
            contact.set_param(Param::new("reg-id", reg_id.to_string()));
        }
    }
    contact
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServiceConfig {
        ServiceConfig::new("proxy")
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new())
    }

    fn local() -> SocketAddr {
        "10.0.0.9:5060".parse().unwrap()
    }

    fn request_with_route(route: &str) -> Request {
        let mut req = Request::new(
            Method::Options,
            Uri::new("10.0.0.2").with_user("bob"),
            NameAddr::new(Uri::new("10.0.0.1").with_user("alice")).with_tag("t"),
            NameAddr::new(Uri::new("10.0.0.2").with_user("bob")),
            "ob-call",
            1,
        );
        req.supported = vec!["outbound".into()];
        req.routes.push(route.parse::<NameAddr>().unwrap());
        req.binding = Some(TransportBinding::new(
            TransportKind::Tcp,
            local(),
            "10.0.0.1:40000".parse().unwrap(),
        ));
        req
    }

    #[test]
    fn foreign_route_is_left_alone() {
        let mut req = request_with_route("<sip:10.9.9.9:5060;lr>");
        let disp = strip_own_routes(&config(), &registry(), local(), &mut req).unwrap();
        assert_eq!(req.routes.len(), 1);
        assert!(disp.forced_dest.is_none());
    }

    #[test]
    fn flow_route_forces_destination() {
        let reg = registry();
        let ua = TransportBinding::new(
            TransportKind::Tcp,
            local(),
            "10.0.0.7:5101".parse().unwrap(),
        );
        let flow = reg.register(ua);
        let route = format!("<sip:{}@10.0.0.9:5060;lr>", encode_flow_token(flow));
        let mut req = request_with_route(&route);

        let disp = strip_own_routes(&config(), &reg, local(), &mut req).unwrap();
        assert!(req.routes.is_empty());
        let forced = disp.forced_dest.unwrap();
        assert_eq!(forced.remote, "10.0.0.7:5101".parse().unwrap());
    }

    #[test]
    fn dead_flow_is_flow_failed_bad_token_is_invalid() {
        let reg = registry();
        let ua = TransportBinding::new(
            TransportKind::Tcp,
            local(),
            "10.0.0.7:5101".parse().unwrap(),
        );
        let flow = reg.register(ua);
        reg.close(flow);

        let route = format!("<sip:{}@10.0.0.9:5060;lr>", encode_flow_token(flow));
        let mut req = request_with_route(&route);
        let err = strip_own_routes(&config(), &reg, local(), &mut req).unwrap_err();
        assert_eq!(err, TransportError::FlowFailed);

        let mut req = request_with_route("<sip:NkF!!notatoken@10.0.0.9:5060;lr>");
        let err = strip_own_routes(&config(), &reg, local(), &mut req).unwrap_err();
        assert_eq!(err, TransportError::InvalidFlowToken);
    }

    #[test]
    fn same_connection_flow_route_records_only() {
        let reg = registry();
        let ua = TransportBinding::new(
            TransportKind::Tcp,
            local(),
            "10.0.0.1:40000".parse().unwrap(),
        );
        let flow = reg.register(ua);
        let route = format!("<sip:{}@10.0.0.9:5060;lr;ob>", encode_flow_token(flow));
        let mut req = request_with_route(&route);
        req.binding = Some(ua.with_flow(flow));

        let disp = strip_own_routes(&config(), &reg, local(), &mut req).unwrap();
        assert!(disp.forced_dest.is_none());
        assert_eq!(disp.record_flow, Some((flow, true)));
    }

    #[test]
    fn register_path_flow_needs_single_reg_id() {
        let reg = registry();
        let mut req = request_with_route("<sip:10.9.9.9;lr>");
        req.method = Method::Register;
        req.cseq.method = Method::Register;
        req.supported = vec!["outbound".into(), "path".into()];
        assert!(register_path_flow(&reg, &req).is_none());

        req.contacts.push(
            NameAddr::new(Uri::new("10.0.0.1").with_user("ua").with_port(5101))
                .with_param(Param::new("reg-id", "1")),
        );
        let (_, first_hop) = register_path_flow(&reg, &req).unwrap();
        assert!(first_hop);

        req.vias
            .push("SIP/2.0/UDP p.example;branch=z9hG4bKx".parse().unwrap());
        req.vias
            .push("SIP/2.0/UDP ua.example;branch=z9hG4bKy".parse().unwrap());
        let (_, first_hop) = register_path_flow(&reg, &req).unwrap();
        assert!(!first_hop);
    }

    #[test]
    fn proxy_route_uri_prefixes() {
        let cfg = config();
        let reg = registry();
        let flow = reg.register(TransportBinding::new(
            TransportKind::Tcp,
            local(),
            "10.0.0.1:40000".parse().unwrap(),
        ));

        let with_flow =
            proxy_route_uri(&cfg, local(), TransportKind::Tcp, Some((flow, true)), "z9hG4bKb");
        assert!(with_flow.uri.user.as_deref().unwrap().starts_with("NkF"));
        assert!(with_flow.uri.is_lr());
        assert!(with_flow.uri.has_param("ob"));

        let without =
            proxy_route_uri(&cfg, local(), TransportKind::Udp, None, "z9hG4bKb");
        assert!(without.uri.user.as_deref().unwrap().starts_with("NkQ"));
        assert!(!without.uri.has_param("ob"));
    }

    #[test]
    fn contact_ob_only_on_dialog_forming_with_outbound() {
        let cfg = config();
        let mut invite = request_with_route("<sip:10.9.9.9;lr>");
        invite.method = Method::Invite;
        invite.cseq.method = Method::Invite;
        let contact = local_contact(&cfg, &invite, local(), TransportKind::Udp, None);
        assert!(contact.uri.has_param("ob"));
        assert!(contact.param("+sip.instance").is_some());

        let mut options = request_with_route("<sip:10.9.9.9;lr>");
        options.method = Method::Options;
        let contact = local_contact(&cfg, &options, local(), TransportKind::Udp, None);
        assert!(!contact.uri.has_param("ob"));

        let mut no_ob = request_with_route("<sip:10.9.9.9;lr>");
        no_ob.method = Method::Invite;
        no_ob.cseq.method = Method::Invite;
        no_ob.supported.clear();
        let contact = local_contact(&cfg, &no_ob, local(), TransportKind::Udp, None);
        assert!(!contact.uri.has_param("ob"));
    }

    #[test]
    fn register_contact_gets_reg_id() {
        let cfg = config().with_reg_id(2);
        let mut reg_req = request_with_route("<sip:10.9.9.9;lr>");
        reg_req.method = Method::Register;
        reg_req.cseq.method = Method::Register;
        let contact = local_contact(&cfg, &reg_req, local(), TransportKind::Tcp, None);
        assert_eq!(contact.param("reg-id").flatten(), Some("2"));
    }
}
